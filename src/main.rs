use clap::{Parser, Subcommand};
use reftable::{Error, FileSource, Reader, HEADER_SIZE};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "reftable", version = "1.0.0", about = "The reftable format CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show table metadata and section layout
    Info {
        input: PathBuf,
        /// Emit machine-readable JSON
        #[arg(long)]
        json: bool,
    },
    /// List refs, optionally starting at a name prefix
    Refs {
        input: PathBuf,
        #[arg(short, long, default_value = "")]
        prefix: String,
    },
    /// List log entries, newest first per ref
    Logs {
        input: PathBuf,
        /// Restrict to one ref name
        #[arg(short, long)]
        r#ref: Option<String>,
    },
    /// List refs pointing at an object id (hex)
    RefsFor {
        input: PathBuf,
        id: String,
    },
}

fn open(path: &PathBuf) -> Result<Reader<FileSource>, Box<dyn std::error::Error>> {
    let src = FileSource::open(path)?;
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("reftable");
    Ok(Reader::new(src, name)?)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    match Cli::parse().command {
        // ── Info ─────────────────────────────────────────────────────────────
        Commands::Info { input, json } => {
            let rd = open(&input)?;
            let section = |s: &reftable::SectionOffsets| {
                serde_json::json!({
                    "present": s.present,
                    "offset": if s.offset == 0 && s.present { HEADER_SIZE as u64 } else { s.offset },
                    "index_offset": s.index_offset,
                })
            };
            let info = serde_json::json!({
                "name": rd.name(),
                "block_size": rd.block_size(),
                "hash_size": rd.hash_size(),
                "min_update_index": rd.min_update_index(),
                "max_update_index": rd.max_update_index(),
                "refs": section(&rd.ref_offsets),
                "objs": section(&rd.obj_offsets),
                "logs": section(&rd.log_offsets),
            });
            if json {
                println!("{}", serde_json::to_string_pretty(&info)?);
            } else {
                println!("{}: block_size={} hash_size={} update_index={}..{}",
                    rd.name(), rd.block_size(), rd.hash_size(),
                    rd.min_update_index(), rd.max_update_index());
                for (label, s) in [("refs", &rd.ref_offsets), ("objs", &rd.obj_offsets),
                                   ("logs", &rd.log_offsets)] {
                    if s.present {
                        println!("  {label}: offset={} index={}", s.offset, s.index_offset);
                    } else {
                        println!("  {label}: absent");
                    }
                }
            }
        }

        // ── Refs ─────────────────────────────────────────────────────────────
        Commands::Refs { input, prefix } => {
            let rd = open(&input)?;
            let mut it = match rd.seek_ref(&prefix) {
                Err(Error::NotExist) => return Ok(()),
                other => other?,
            };
            while let Some(r) = it.next_ref()? {
                if !r.ref_name.starts_with(&prefix) {
                    break;
                }
                let shown = match (&r.value, &r.target) {
                    (_, Some(target)) => format!("-> {target}"),
                    (Some(id), _) => hex::encode(id),
                    _ => "(deleted)".to_owned(),
                };
                match &r.target_value {
                    Some(peeled) => {
                        println!("{} {} peeled {}", r.ref_name, shown, hex::encode(peeled));
                    }
                    None => println!("{} {}", r.ref_name, shown),
                }
            }
        }

        // ── Logs ─────────────────────────────────────────────────────────────
        Commands::Logs { input, r#ref } => {
            let rd = open(&input)?;
            let start = r#ref.as_deref().unwrap_or("");
            let mut it = match rd.seek_log(start) {
                Err(Error::NotExist) => return Ok(()),
                other => other?,
            };
            while let Some(l) = it.next_log()? {
                if let Some(name) = &r#ref {
                    if &l.ref_name != name {
                        break;
                    }
                }
                let old = l.old_hash.as_deref().map(hex::encode).unwrap_or_default();
                let new = l.new_hash.as_deref().map(hex::encode).unwrap_or_default();
                println!(
                    "{}@{} {} -> {} {} <{}> {} {:+05} {:?}",
                    l.ref_name, l.update_index, old, new,
                    l.name, l.email, l.time, l.tz_offset, l.message
                );
            }
        }

        // ── RefsFor ──────────────────────────────────────────────────────────
        Commands::RefsFor { input, id } => {
            let rd = open(&input)?;
            let oid = hex::decode(&id)?;
            let mut it = match rd.refs_for(&oid) {
                Err(Error::NotExist) => return Ok(()),
                other => other?,
            };
            while let Some(r) = it.next_ref()? {
                println!("{}", r.ref_name);
            }
        }
    }
    Ok(())
}
