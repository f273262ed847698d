//! Headless pipeline runner: read a config, run the graph once, write the
//! sinks. `RUST_LOG=debug` shows the allocation and recording chatter.

use std::process::exit;
use std::sync::Arc;

use log::error;

use rawpipe::device::Device;
use rawpipe::graph::{config, Graph, GraphRun};
use rawpipe::Registry;

fn main() {
    pretty_env_logger::init();

    let mut args = std::env::args().skip(1);
    let Some(cfg) = args.next() else {
        eprintln!("usage: rawpipe-cli <pipeline.cfg> [module-dir]");
        exit(1);
    };
    let module_dir = args.next().unwrap_or_else(|| "modules".into());

    let registry = Arc::new(Registry::with_builtins(module_dir));
    let device = match Device::new() {
        Ok(d) => d,
        Err(e) => {
            error!("device init failed: {}", e);
            exit(1);
        }
    };

    let mut graph = Graph::new(registry);
    if let Err(e) = config::read_config(&mut graph, &cfg) {
        error!("{}", e);
        graph.cleanup(&device);
        exit(1);
    }
    let res = graph.run(&device, GraphRun::all());
    graph.cleanup(&device);
    if let Err(e) = res {
        error!("run failed: {}", e);
        exit(1);
    }
}
