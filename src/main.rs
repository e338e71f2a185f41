use std::path::PathBuf;

use jiff::Timestamp;
use tracing_subscriber::{fmt::format::FmtSpan, layer::SubscriberExt as _, util::SubscriberInitExt as _, EnvFilter};

use journal_store::chain::Direction;
use journal_store::reader::JournalReader;
use journal_store::writer::{CreateOptions, JournalWriter};

fn usage() -> ! {
    eprintln!("usage:");
    eprintln!("  journal-store write <directory> <scope> <MESSAGE>");
    eprintln!("  journal-store read <directory> <scope>");
    std::process::exit(2)
}

fn main() -> std::io::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new("journal_store=info"))
                .unwrap(),
        )
        .with(tracing_subscriber::fmt::layer().with_span_events(FmtSpan::NEW | FmtSpan::CLOSE))
        .init();

    let mut args = std::env::args().skip(1);
    let command = args.next().unwrap_or_else(|| usage());

    match command.as_str() {
        "write" => {
            let directory = PathBuf::from(args.next().unwrap_or_else(|| usage()));
            let scope = args.next().unwrap_or_else(|| usage());
            let message = args.next().unwrap_or_else(|| usage());

            let options = CreateOptions::new(machine_id()?, boot_id(), scope);
            let mut writer = JournalWriter::open(&directory, options)?;
            let field = format!("MESSAGE={message}");
            writer.write_entry(Timestamp::now(), monotonic_now(), &[field.as_bytes()])?;
            writer.close()?;
            Ok(())
        }
        "read" => {
            let directory = PathBuf::from(args.next().unwrap_or_else(|| usage()));
            let scope = args.next().unwrap_or_else(|| usage());

            let mut reader = JournalReader::new(&directory, scope)?;
            while let Some(entry) = reader.step(Direction::Down)? {
                for field in &entry.fields {
                    print!("{} ", bstr::BStr::new(field));
                }
                println!();
            }
            Ok(())
        }
        _ => usage(),
    }
}

fn machine_id() -> std::io::Result<u128> {
    match std::fs::read_to_string("/etc/machine-id") {
        Ok(text) => Ok(u128::from_str_radix(text.trim(), 16).unwrap_or(0)),
        Err(_) => Ok(0),
    }
}

fn boot_id() -> u128 {
    std::fs::read_to_string("/proc/sys/kernel/random/boot_id")
        .ok()
        .and_then(|text| u128::from_str_radix(&text.trim().replace('-', ""), 16).ok())
        .unwrap_or(1)
}

fn monotonic_now() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_micros() as u64).unwrap_or(1).max(1)
}
