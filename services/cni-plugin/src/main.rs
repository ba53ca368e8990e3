//! `vxnet` CNI plugin binary.

use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use tracing::{error, info};
use vxnet_cni::logging::{self, DEFAULT_LOG_FILE};
use vxnet_cni::protocol::FALLBACK_VERSION;
use vxnet_cni::{CniArgs, ErrorResult, Ledger, NetConf, Plugin, DEFAULT_LEDGER_PATH};
use vxnet_networking::{IpRoute2, NetworkError};

fn main() -> ExitCode {
    let log_path = env_path("VXNET_LOG_FILE", DEFAULT_LOG_FILE);
    if let Err(e) = logging::init(&log_path) {
        // Keep going: stdout is the only channel the runtime reads.
        eprintln!("Failed to initialize logging: {}", e);
    }

    let mut stdin = Vec::new();
    if let Err(e) = io::stdin().read_to_end(&mut stdin) {
        return fail(&NetworkError::Io(e), &stdin);
    }

    let args = match CniArgs::from_env() {
        Ok(args) => args,
        Err(e) => return fail(&e, &stdin),
    };

    info!(
        command = ?args.command,
        container_id = %args.container_id,
        interface = %args.if_name,
        "vxnet plugin invoked"
    );

    let ledger = Ledger::new(env_path("VXNET_LEDGER_PATH", DEFAULT_LEDGER_PATH));
    let plugin = Plugin::new(IpRoute2::new(), ledger);

    match plugin.run(&args, &stdin) {
        Ok(output) => {
            if let Some(json) = output {
                let mut stdout = io::stdout().lock();
                if writeln!(stdout, "{}", json).is_err() {
                    return ExitCode::from(1);
                }
            }
            ExitCode::SUCCESS
        }
        Err(e) => fail(&e, &stdin),
    }
}

fn env_path(key: &str, default: &str) -> PathBuf {
    std::env::var_os(key)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(default))
}

fn fail(err: &NetworkError, stdin: &[u8]) -> ExitCode {
    error!(error = %err, reason = err.reason_code(), "vxnet plugin failed");

    let version = NetConf::peek_version(stdin).unwrap_or_else(|| FALLBACK_VERSION.to_string());
    let result = ErrorResult::from_error(err, &version);
    match serde_json::to_string(&result) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Failed to encode error result: {}", e),
    }

    ExitCode::from(1)
}
