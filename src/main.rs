use std::io::Result;

use clap::{App, Arg};
use env_logger::Builder;
use log::{debug, info, LevelFilter};

use bgp_scand::rib::{Bgp, LogHooks};
use bgp_scand::{command_channel, config, Scanner};

#[tokio::main]
async fn main() -> Result<()> {
    let matches = App::new("bgp-scand")
        .version("0.1")
        .about("BGP nexthop reachability scanner")
        .arg(
            Arg::with_name("configpath")
                .short("c")
                .long("config-path")
                .help("Path to scanner config")
                .takes_value(true)
                .index(1)
                .required(true),
        )
        .arg(
            Arg::with_name("v")
                .short("v")
                .multiple(true)
                .help("Sets the level of logging verbosity"),
        )
        .get_matches();

    let config_path: String = matches
        .value_of("configpath")
        .unwrap()
        .parse()
        .expect("Must specify a valid config path");

    let (scand_level, other_level) = match matches.occurrences_of("v") {
        0 => (LevelFilter::Info, LevelFilter::Warn),
        1 => (LevelFilter::Debug, LevelFilter::Warn),
        2 => (LevelFilter::Trace, LevelFilter::Warn),
        _ => (LevelFilter::Trace, LevelFilter::Trace),
    };
    Builder::new()
        .filter(Some("bgp_scand"), scand_level)
        .filter(None, other_level)
        .init();
    info!("Logging at levels {}/{}", scand_level, other_level);

    let config = config::from_file(&config_path)?;
    debug!(
        "Found {} peers and {} network statements in {}",
        config.peers.len(),
        config.static_routes.len(),
        config_path
    );

    let bgp = Bgp::from_config(&config);
    let mut scanner = Scanner::new(&config);
    for interface in &config.interfaces {
        for ifc in interface.connected_addrs() {
            scanner.connected_add(&ifc);
        }
    }

    let (handle, rx) = command_channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            handle.shutdown();
        }
    });

    info!(
        "Starting BGP scanner [scan {}s, import {}s] against {}...",
        config.scan_time,
        config.import_time,
        config.zserv_path.display()
    );
    scanner.serve(bgp, LogHooks::default(), rx).await;

    Ok(())
}
