use std::process::exit;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use scientisst_sense::{logging, ApiMode, Sense};

#[derive(Parser, Debug)]
#[command(name = "sense-demo", about = "Connect to a ScientISST Sense and read frames")]
struct Args {
    /// Bluetooth MAC address (e.g., AA:BB:CC:DD:EE:FF)
    mac: String,
    /// Pre-bound serial device node to use instead of RFCOMM (e.g., /dev/rfcomm0)
    #[arg(long)]
    serial: Option<String>,
    /// Sampling rate in Hz
    #[arg(long, default_value_t = 1000)]
    rate: u32,
    /// Channel IDs to acquire (1-6 internal, 7-8 external); default all
    #[arg(long, value_delimiter = ',')]
    channels: Vec<u8>,
}

fn main() {
    logging::init();
    if let Err(e) = run() {
        eprintln!("Error: {e}");
        exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();

    println!("--- Connecting to ScientISST Sense at {} ---", args.mac);
    let mut sense = Sense::new(&args.mac)?;
    match &args.serial {
        Some(path) => sense.connect_serial(path, None)?,
        None => sense.connect(None)?,
    }

    println!("Connected! Getting version...");
    match sense.version() {
        Ok(v) => println!("Version: {}", v.trim()),
        Err(e) => println!("Version: unknown ({e})"),
    }

    println!("Starting acquisition ({} Hz)...", args.rate);
    sense.start(args.rate, &args.channels, false, ApiMode::Scientisst)?;

    println!("Reading 10 batches of 100 frames...");
    for i in 0..10 {
        match sense.read_batch(100) {
            Ok(batch) => {
                if let Some(first) = batch.frames.first() {
                    println!(
                        "[Batch {}] seq: {:02} | analog: {:?}",
                        i, first.seq, first.analog
                    );
                }
                if batch.sequence_gaps > 0 {
                    eprintln!("~{} frame(s) dropped in batch {}", batch.sequence_gaps, i);
                }
            }
            Err(e) => eprintln!("Read error: {}", e),
        }
        thread::sleep(Duration::from_millis(10));
    }

    println!("Stopping...");
    sense.stop()?;
    sense.disconnect()?;
    println!("Done.");
    Ok(())
}
