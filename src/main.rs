use std::env;
use std::fs;
use std::process;

use anyhow::Context;
use montreal_sim_backend::{run_request, SimulationRequest};

fn main() {
    env_logger::init();

    let args: Vec<String> = env::args().collect();

    if args.len() != 2 {
        eprintln!("Usage: {} <scenario_json_file>", args[0]);
        process::exit(1);
    }

    let input_file = &args[1];

    let request = match load_request(input_file) {
        Ok(request) => request,
        Err(e) => {
            eprintln!("Error loading scenario file: {:#}", e);
            process::exit(1);
        }
    };

    // The framed response carries its own status line, so failures in
    // the run itself still print as a normal response
    print!("{}", run_request(request));
}

fn load_request(path: &str) -> anyhow::Result<SimulationRequest> {
    let raw = fs::read_to_string(path).with_context(|| format!("reading {}", path))?;
    let request: SimulationRequest =
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path))?;

    if request.scenarios.is_empty() {
        anyhow::bail!("scenario file contains no scenarios");
    }
    Ok(request)
}
