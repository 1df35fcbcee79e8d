use std::env;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use getopts::Options;
use log::LevelFilter;
use simple_logger::SimpleLogger;

use warden::dns::context::{ServerConfig, ServerContext, UpstreamOrder};
use warden::dns::metrics::export_metrics;
use warden::dns::server::start_servers;

fn print_usage(program: &str, opts: Options) {
    let brief = format!("Usage: {} [options]", program);
    print!("{}", opts.usage(&brief));
}

/// Accepts `ip` or `ip:port`, defaulting to port 53.
fn parse_upstream(value: &str) -> Option<SocketAddr> {
    value
        .parse::<SocketAddr>()
        .ok()
        .or_else(|| value.parse::<IpAddr>().ok().map(|ip| SocketAddr::new(ip, 53)))
}

fn parse_order(value: &str) -> Option<UpstreamOrder> {
    match value {
        "as-configured" => Some(UpstreamOrder::AsConfigured),
        "ipv4-first" => Some(UpstreamOrder::Ipv4First),
        "interleaved" => Some(UpstreamOrder::Interleaved),
        _ => None,
    }
}

/// Main entry point for the Warden DNS server
#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();
    let program = args[0].clone();

    let mut opts = Options::new();
    opts.optflag("h", "help", "print this help menu");
    opts.optflag("v", "verbose", "log debug output");
    opts.optmulti(
        "f",
        "forward-address",
        "Upstream DNS server for forwarding (e.g. 8.8.8.8 or [2001:db8::1]:53)",
        "FORWARDIP",
    );
    opts.optopt(
        "",
        "upstream-order",
        "Order upstreams are tried in (as-configured, ipv4-first, interleaved)",
        "ORDER",
    );
    opts.optopt("l", "listen", "Address to listen on", "ADDRESS");
    opts.optopt("p", "port", "Port for DNS queries", "PORT");
    opts.optopt(
        "t",
        "transfer-port",
        "Dedicated port for zone transfers",
        "PORT",
    );
    opts.optopt(
        "j",
        "zones-dir",
        "The directory for the zone files",
        "DIRECTORY",
    );
    opts.optopt(
        "",
        "cname-depth",
        "Maximum number of CNAME hops to follow",
        "HOPS",
    );
    opts.optflag("n", "no-recursion", "Only answer from local zones and the cache");

    let opt_matches = match opts.parse(&args[1..]) {
        Ok(m) => m,
        Err(f) => {
            eprintln!("{}", f);
            print_usage(&program, opts);
            std::process::exit(2);
        }
    };

    if opt_matches.opt_present("h") {
        print_usage(&program, opts);
        return;
    }

    let level = if opt_matches.opt_present("v") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    if let Err(e) = SimpleLogger::new().with_level(level).init() {
        eprintln!("Failed to initialize logger: {}", e);
    }

    let mut config = ServerConfig::default();

    for value in opt_matches.opt_strs("f") {
        match parse_upstream(&value) {
            Some(addr) => config.upstreams.push(addr),
            None => log::warn!("Forward address {} is not a valid IP - ignoring it", value),
        }
    }

    if let Some(value) = opt_matches.opt_str("upstream-order") {
        match parse_order(&value) {
            Some(order) => config.upstream_order = order,
            None => log::warn!("Unknown upstream order {}, using {:?}", value, config.upstream_order),
        }
    }

    if let Some(value) = opt_matches.opt_str("l") {
        match value.parse::<IpAddr>() {
            Ok(addr) => config.listen_addr = addr,
            Err(_) => log::warn!("Listen address {} is not a valid IP - ignoring it", value),
        }
    }

    if let Some(value) = opt_matches.opt_str("p") {
        match value.parse::<u16>() {
            Ok(port) => config.dns_port = port,
            Err(_) => log::warn!("Port {} is not valid - using {}", value, config.dns_port),
        }
    }

    if let Some(value) = opt_matches.opt_str("t") {
        match value.parse::<u16>() {
            Ok(port) => config.transfer_port = Some(port),
            Err(_) => log::warn!("Transfer port {} is not valid - not listening", value),
        }
    }

    if let Some(value) = opt_matches.opt_str("cname-depth") {
        match value.parse::<usize>() {
            Ok(depth) => config.max_cname_depth = depth,
            Err(_) => log::warn!("CNAME depth {} is not valid - using {}", value, config.max_cname_depth),
        }
    }

    config.zones_dir = opt_matches.opt_str("j").map(PathBuf::from);
    config.allow_recursive = !opt_matches.opt_present("n");

    if config.allow_recursive && config.upstreams.is_empty() {
        log::info!("No upstream servers configured - answering from local zones only");
    }

    let context = Arc::new(ServerContext::new(config));

    if let Err(e) = context.initialize() {
        log::error!("Server failed to initialize: {}", e);
        std::process::exit(1);
    }

    match start_servers(context.clone()) {
        Ok(addrs) => {
            for addr in addrs {
                log::info!("Serving on {}", addr);
            }
        }
        Err(e) => {
            log::error!("Failed to start listeners: {}", e);
            std::process::exit(1);
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to wait for shutdown signal: {}", e);
    }

    let statistics = &context.statistics;
    log::info!(
        "Shutting down after {} UDP queries, {} TCP queries, {} transfers ({} dropped)",
        statistics.get_udp_query_count(),
        statistics.get_tcp_query_count(),
        statistics.get_transfer_count(),
        statistics.get_dropped_count()
    );

    match export_metrics() {
        Ok(text) => log::debug!("Final metrics:\n{}", text),
        Err(e) => log::warn!("Failed to export metrics: {}", e),
    }

    if let Some(ref zones_dir) = context.config.zones_dir {
        if let Err(e) = context.authority.save(zones_dir) {
            log::warn!("Failed to save zones to {:?}: {}", zones_dir, e);
        }
    }
}
