//! The `tboxd` vehicle telematics agent binary.
use std::path::PathBuf;

use clap::Parser;
use log::{error, info, warn};

use tbox::supervisor::{AgentOptions, Supervisor, exit_code};

#[derive(Debug, Parser)]
#[command(name = "tboxd", about = "Vehicle telematics agent", version)]
struct Args {
    /// Start as daemon (use the service manager; accepted for
    /// compatibility).
    #[arg(short = 'D', long)]
    daemon: bool,

    /// Vehicle identification number.
    #[arg(short = 'N', long)]
    vin: Option<String>,

    /// SIM card ICCID.
    #[arg(short = 'I', long)]
    iccid: Option<String>,

    /// Log storage path.
    #[arg(short = 'L', long, default_value = "/var/lib/tbox/log")]
    log_storage_path: PathBuf,

    /// Configuration path.
    #[arg(short = 'C', long, default_value = "/var/lib/tbox/conf")]
    config_path: PathBuf,

    /// Fleet server tried before the configured list.
    #[arg(long)]
    fallback_vehicle_server_host: Option<String>,

    /// Port for the fallback fleet server.
    #[arg(long, default_value_t = 0)]
    fallback_vehicle_server_port: u16,

    /// Serial port of the companion MCU.
    #[arg(long, default_value = "/dev/ttymxc3")]
    stm_serial_port: String,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let Some(vin) = args.vin else {
        error!("VIN code should be specified");
        std::process::exit(1);
    };
    let Some(iccid) = args.iccid else {
        error!("ICCID code should be specified");
        std::process::exit(1);
    };
    if args.daemon {
        warn!("--daemon accepted but ignored; run under a service manager");
    }

    let fallback_server = args.fallback_vehicle_server_host.map(|host| {
        if args.fallback_vehicle_server_port != 0 {
            format!("{host}:{}", args.fallback_vehicle_server_port)
        } else {
            host
        }
    });

    let options = AgentOptions {
        vin,
        iccid,
        conf_dir: args.config_path,
        log_dir: args.log_storage_path,
        serial_port: args.stm_serial_port,
        fallback_server,
    };

    match Supervisor::new(options).run() {
        Ok(poweroff) => {
            if poweroff {
                info!("handing over to poweroff");
                if let Err(e) = std::process::Command::new("/sbin/poweroff").spawn() {
                    error!("cannot run poweroff: {e}");
                }
            }
        }
        Err(e) => {
            error!("agent failed to start: {e}");
            std::process::exit(exit_code(&e));
        }
    }
}
