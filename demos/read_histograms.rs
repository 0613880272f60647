//! Example: Reading histograms from a board
//!
//! Run with: cargo run --example read_histograms
//!
//! This example demonstrates:
//! - Loading settings (address, timeouts, register map) from FITtest.toml
//! - Running the electronics model on a controller thread
//! - Printing notifications as they arrive
//! - Exporting a complete readout to Histograms.csv

use std::thread;
use std::time::{Duration, Instant};

use env_logger::Env;
use fit_ipbus::utils::present_links;
use fit_ipbus::{
    export, Controller, Event, FitElectronics, Notifier, Settings, Target, DEFAULT_SETTINGS_FILE,
};

fn main() -> fit_ipbus::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    // =========================================================================
    // Settings and controller
    // =========================================================================

    let mut settings = Settings::load_or_default(DEFAULT_SETTINGS_FILE);
    let target = Target::udp(settings.target_config(), Notifier::new())?;
    let fit = FitElectronics::new(target, settings.registers.clone())
        .with_read_policy(settings.read_policy());
    let controller = Controller::spawn(fit, settings.poll_policy())?;

    let events = controller.subscribe();
    let printer = thread::spawn(move || {
        for event in events {
            match event {
                Event::NetworkError(msg) => println!("Network error: {}", msg),
                Event::BusError(msg) => println!("IPbus error: {}", msg),
                Event::LogicError(msg) => println!("Logic error: {}", msg),
                Event::Online => println!("online"),
                Event::Unreachable => println!("no response"),
                Event::LinkMaskReady(mask) => {
                    println!("links present: {}", present_links(mask).join(" "))
                }
                Event::StatusReady(status) => println!(
                    "status: PLL 0x{:X}{} hist {} filter {} BCID {}",
                    status.board.pll_locked,
                    if status.board.resetting { " (resetting)" } else { "" },
                    status.hist.hist_on,
                    status.hist.filter_on,
                    status.hist.bcid
                ),
            }
        }
    });

    // =========================================================================
    // Configure and read
    // =========================================================================

    controller.reconnect();
    controller.select_channel(0);
    controller.set_histogramming(true);
    thread::sleep(Duration::from_secs(2));

    let start = Instant::now();
    match controller.read_histograms() {
        Some(readout) if readout.is_complete() => {
            println!("Data read in {:.3} ms", start.elapsed().as_secs_f64() * 1e3);
            let start = Instant::now();
            export::save_table(&readout.data, export::DEFAULT_TABLE_FILE)?;
            println!(
                "dumped to {} in {:.3} ms",
                export::DEFAULT_TABLE_FILE,
                start.elapsed().as_secs_f64() * 1e3
            );
        }
        Some(readout) => println!(
            "{:.0}% of data read",
            100.0 * readout.words as f64 / fit_ipbus::HISTOGRAM_WORDS as f64
        ),
        None => println!("controller stopped"),
    }

    settings.ip_address = controller.address().to_string();
    controller.shutdown();
    let _ = printer.join();

    if let Err(e) = settings.save(DEFAULT_SETTINGS_FILE) {
        eprintln!("could not save settings: {}", e);
    }
    Ok(())
}
