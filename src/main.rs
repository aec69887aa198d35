use anyhow::{Context, Result};
use clap::Parser;
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use std::{ops::Deref, panic};

mod commandline;
mod daemon;
mod mqtt;

use dalyble_lib::bluest_transport::{discover_devices, BluestTransport};
use dalyble_lib::{BmsClient, Monitor};

fn logging_init(loglevel: LevelFilter) -> LoggerHandle {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .expect("Cannot init logging")
        .start()
        .expect("Cannot start logging");

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown>", 0, 0));
        let cause = panic_info
            .payload()
            .downcast_ref::<String>()
            .map(String::deref);
        let cause = cause.unwrap_or_else(|| {
            panic_info
                .payload()
                .downcast_ref::<&str>()
                .copied()
                .unwrap_or("<cause unknown>")
        });

        error!(
            "Thread '{}' panicked at {}:{}:{}: {}",
            std::thread::current().name().unwrap_or("<unknown>"),
            filename,
            line,
            column,
            cause
        );
    }));
    log_handle
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = commandline::CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter());

    let config = args.session_config();

    match args.command.clone() {
        commandline::CliCommands::Scan { timeout } => {
            let devices = discover_devices(timeout)
                .await
                .with_context(|| "Scan failed")?;
            for device in devices {
                let name = if device.name.is_empty() {
                    "<unknown>"
                } else {
                    device.name.as_str()
                };
                let rssi = device
                    .rssi
                    .map(|rssi| rssi.to_string())
                    .unwrap_or_else(|| "?".into());
                println!("{}  {name}  rssi={rssi}", device.id);
            }
        }
        commandline::CliCommands::Daemon { output, interval } => {
            let mut config = config;
            config.read_interval = interval;
            let transport = BluestTransport::new(&config.address);
            let monitor = Monitor::spawn(transport, config);
            daemon::run(monitor, output).await?;
        }
        command => {
            let transport = BluestTransport::new(&config.address);
            let mut client = BmsClient::new(transport, config);
            client.connect().await.with_context(|| "Cannot connect to BMS")?;
            client.wake().await;
            let outcome = run_one_shot(&mut client, command).await;
            client.disconnect().await;
            outcome?;
        }
    }

    Ok(())
}

async fn run_one_shot(
    client: &mut BmsClient<BluestTransport>,
    command: commandline::CliCommands,
) -> Result<()> {
    match command {
        commandline::CliCommands::Telemetry => {
            let reading = client
                .read_snapshot()
                .await
                .with_context(|| "Cannot read telemetry")?;
            println!(
                "Pack: {:.1}V {:.1}A ({:?}), power {:.1}W",
                reading.total_voltage_v,
                reading.current_a,
                reading.current_direction,
                reading.power_w()
            );
            println!("Cells: {:?}", reading.cell_voltages_v);
            println!("Temperatures: {:?}", reading.temperatures_c);
            match reading.soc_percent {
                Some(soc) if reading.soc_estimated => println!("SOC: {soc:.1}% (estimated)"),
                Some(soc) => println!("SOC: {soc:.1}%"),
                None => println!("SOC: unavailable"),
            }
        }
        commandline::CliCommands::Soc => {
            match client.read_soc().await.with_context(|| "Cannot read SOC")? {
                Some(soc) => println!("SOC: {soc:.1}%"),
                None => println!("SOC: register holds no plausible value"),
            }
        }
        commandline::CliCommands::CellVoltages => {
            let cells = client
                .read_cell_voltages()
                .await
                .with_context(|| "Cannot read cell voltages")?;
            println!("Cell voltages: {cells:?}");
        }
        commandline::CliCommands::Temperatures => {
            let temperatures = client
                .read_temperatures()
                .await
                .with_context(|| "Cannot read temperatures")?;
            println!("Temperatures: {temperatures:?}");
        }
        commandline::CliCommands::Scan { .. } | commandline::CliCommands::Daemon { .. } => {
            unreachable!("handled in main")
        }
    }
    Ok(())
}
