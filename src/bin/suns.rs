//! One-shot SunSpec device dump.
//!
//! Scans a device over the selected transport, reads every model and prints a human-readable
//! listing of all implemented points. Exits 0 on success, 1 on any error.

use clap::Parser;
use std::time::Duration;
use sunspec::client::ClientDevice;
use sunspec::error::Error;
use sunspec::io::Parity;
use sunspec::pathlist::PathList;
use sunspec::smdx::ModelRegistry;
use sunspec_wire::{PointKind, Value};

#[derive(Parser)]
#[clap(name = "suns", about = "Scan a SunSpec device and dump its models")]
struct Args {
    /// Transport type: tcp, rtu or mapped
    #[clap(short = 't', long = "transport", default_value = "tcp")]
    transport: String,

    /// Modbus slave address
    #[clap(short = 'a', long = "slave-id", default_value_t = 1)]
    slave_id: u8,

    /// IP address for Modbus TCP
    #[clap(short = 'i', long = "ip", default_value = "localhost")]
    ip: String,

    /// Port number for Modbus TCP
    #[clap(short = 'P', long = "port", default_value_t = 502)]
    port: u16,

    /// Serial port for Modbus RTU
    #[clap(short = 'p', long = "serial", default_value = "/dev/ttyUSB0")]
    serial: String,

    /// Baud rate for Modbus RTU
    #[clap(short = 'b', long = "baudrate", default_value_t = 9600)]
    baudrate: u32,

    /// Serial parity: n or e
    #[clap(long = "parity", default_value = "n")]
    parity: String,

    /// Timeout in seconds, may be fractional
    #[clap(short = 'T', long = "timeout", default_value_t = 2.0)]
    timeout: f64,

    /// Register map file for the mapped transport
    #[clap(short = 'm', long = "map-file")]
    map_file: Option<String>,

    /// Directory containing model definition files
    #[clap(short = 'M', long = "model-dir")]
    model_dir: Option<String>,
}

fn main() {
    env_logger::init();

    let args = Args::parse();

    if let Err(e) = run(&args) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), Error> {
    if let Some(model_dir) = &args.model_dir {
        ModelRegistry::global().set_pathlist(PathList::from_paths([".", model_dir.as_str()]));
    }

    let timeout = Duration::from_secs_f64(args.timeout);

    let mut device = match args.transport.as_str() {
        "tcp" => ClientDevice::tcp(args.slave_id, &args.ip, args.port, Some(timeout))?,
        "rtu" => {
            let parity = match args.parity.as_str() {
                "e" | "E" => Parity::Even,
                _ => Parity::None,
            };

            ClientDevice::rtu(
                args.slave_id,
                &args.serial,
                Some(args.baudrate),
                Some(parity),
                Some(timeout),
            )?
        }
        "mapped" => {
            let Some(map_file) = &args.map_file else {
                eprintln!("Error: map file required for mapped transport");
                std::process::exit(1);
            };

            ClientDevice::mapped(map_file, None)?
        }
        other => {
            eprintln!("Error: unknown transport '{}'", other);
            std::process::exit(1);
        }
    };

    device.scan()?;
    device.read_points()?;

    for model in device.device().models() {
        let label = match model.model_type().and_then(|mt| mt.label.clone()) {
            Some(label) => format!("{} ({})", label, model.id()),
            None => format!("({})", model.id()),
        };

        println!("\nmodel: {}\n", label);

        if let Some(error) = model.load_error() {
            println!("   load error: {}", error);

            continue;
        }

        for block in model.blocks() {
            let index = if block.index() > 0 {
                format!("{:02}:", block.index())
            } else {
                "   ".to_string()
            };

            for point in block.points() {
                let Some(value) = point.value() else {
                    continue;
                };

                let point_type = point.point_type();

                let label = match &point_type.label {
                    Some(label) => format!("   {}{} ({}):", index, label, point_type.id),
                    None => format!("   {}({}):", index, point_type.id),
                };

                let value = format_value(point_type.kind, &value);
                let units = point_type.units.as_deref().unwrap_or("");

                println!("{:<40} {:>20} {:<10}", label, value, units);
            }
        }
    }

    Ok(())
}

fn format_value(kind: PointKind, value: &Value) -> String {
    match (kind, value) {
        (PointKind::Bitfield16, Value::Unsigned(v)) => format!("{:#06x}", v),
        (PointKind::Bitfield32, Value::Unsigned(v)) => format!("{:#010x}", v),
        _ => value.to_string(),
    }
}
