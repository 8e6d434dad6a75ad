use std::env;
use std::fs::metadata;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Result;
use clap::CommandFactory;
use clap::Parser;
use clap::Subcommand;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use stowage::types::{InlinePolicy, TypeTable, Value};
use stowage::Stowage;
use strum::EnumString;

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Stowage file location
    file: String,

    #[command(subcommand)]
    parameter: Option<Parameter>,
}

#[derive(Debug, EnumString, Subcommand)]
#[strum(ascii_case_insensitive)]
enum Parameter {
    /// Describe the datatype committed with this index
    Describe { index: i64 },
    /// Interactive Help
    Help,
    /// List named root links
    Links,
    /// Display the recorded inline policy
    Policy,
    /// Show the value bound to this name
    Show { name: String },
    /// List committed datatypes
    Types,
}

fn get_history_file() -> Option<PathBuf> {
    dirs::preference_dir()
        .and_then(|mut base| {
            base.push("stowage");
            // Note: Not create_dir_all(), because we don't want to create preference
            // dirs if they don't exist.
            if metadata(base.clone()).ok().is_none() {
                std::fs::create_dir(base.clone()).ok()?
            }
            Some(base)
        })
        .map(|mut base| {
            base.push("history.txt");
            base
        })
}

async fn interactive(store: &mut Stowage) -> Result<()> {
    let isatty = unsafe { libc::isatty(0) };

    let mut rl = DefaultEditor::new()?;
    if isatty == 1 {
        if let Some(file_location) = get_history_file() {
            if let Err(e) = rl.load_history(&file_location) {
                println!("error loading history: {e}");
            }
        }
    }
    println!("terminate with ctrl-c or ctrl-d");
    loop {
        let readline = rl.readline("stowage> ");
        match readline {
            Ok(line) => {
                if line.is_empty() {
                    continue;
                }
                // EnumString doesn't deal with variant parameters, so...
                let words = line.split_whitespace().collect::<Vec<&str>>();
                let parameter = match Parameter::from_str(words[0]) {
                    Ok(p) => match p {
                        Parameter::Describe { index: _ } => {
                            let index = match words.get(1).map(|w| w.parse::<i64>()) {
                                Some(Ok(index)) if words.len() == 2 => index,
                                _ => {
                                    println!("usage: describe <index>");
                                    continue;
                                }
                            };
                            Parameter::Describe { index }
                        }
                        Parameter::Show { name: _ } => {
                            if words.len() != 2 {
                                println!("usage: show <name>");
                                continue;
                            }
                            Parameter::Show {
                                name: words[1].to_string(),
                            }
                        }
                        _ => p,
                    },
                    Err(e) => {
                        println!("error: {e}");
                        continue;
                    }
                };
                process_parameter(store, &parameter);
                if isatty == 1 {
                    rl.add_history_entry(line.as_str())?;
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("terminating...");
                break;
            }
            Err(ReadlineError::Eof) => {
                println!("terminating...");
                break;
            }
            Err(err) => {
                println!("error: {err:?}");
                break;
            }
        }
    }
    if isatty == 1 {
        if let Some(file_location) = get_history_file() {
            if let Err(e) = rl.save_history(&file_location) {
                println!("error saving history: {e}");
            }
        }
    }
    Ok(())
}

fn print_value(value: &Value) {
    println!("{value}");
    if let Some(array) = value.as_array() {
        for (idx, item) in array.items().iter().enumerate() {
            println!("  [{idx}] {item}");
        }
    }
}

fn process_parameter(store: &mut Stowage, parameter: &Parameter) {
    match parameter {
        Parameter::Describe { index } => {
            let committed = match store.committed() {
                Ok(committed) => committed,
                Err(e) => {
                    println!("error: {e}");
                    return;
                }
            };
            let Some(entry) = committed.into_iter().find(|c| c.index == *index) else {
                println!("not found");
                return;
            };
            println!("index:    {}", entry.index);
            println!("address:  {}", entry.address);
            println!("name:     {}", entry.name.as_deref().unwrap_or("-"));
            println!("datatype: {}", entry.datatype);
            println!("empty:    {}", entry.empty);
            println!("mutable:  {}", entry.mutable);
            for member in entry.datatype.members() {
                println!("  @{:<4} {}: {}", member.offset, member.name, member.datatype);
            }
            match store.resolve_type(entry.address) {
                Ok(ty) => println!("type:     {ty}"),
                Err(e) => println!("type:     unresolved ({e})"),
            }
        }
        Parameter::Help => {
            let help = Cli::command().render_help().to_string();

            let mut print_it = false;

            for line in help.lines() {
                if line.starts_with("Arguments:") {
                    print_it = false;
                }
                if print_it && !line.is_empty() {
                    println!("{}", line);
                }
                if line.starts_with("Commands:") {
                    print_it = true;
                }
            }
        }
        Parameter::Links => {
            for (name, reference) in store.links() {
                println!("{name}: #{}", reference.0);
            }
        }
        Parameter::Policy => {
            let policy = store.policy();
            println!("inline tuples:     {}", policy.tuples);
            println!("inline immutables: {}", policy.immutables);
        }
        Parameter::Show { name } => match store.read(name) {
            Ok(Some(value)) => print_value(&value),
            Ok(None) => println!("not found"),
            Err(e) => println!("error: {e}"),
        },
        Parameter::Types => match store.committed() {
            Ok(committed) => {
                for entry in committed {
                    println!(
                        "{:>4} @{:<6} {:<32} {}",
                        entry.index,
                        entry.address,
                        entry.name.as_deref().unwrap_or("-"),
                        entry.datatype
                    );
                }
            }
            Err(e) => println!("error: {e}"),
        },
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_dir = match env::var("TMPDIR") {
        Ok(d) => d,
        Err(_e) => ".".to_string(),
    };

    let file_appender = tracing_appender::rolling::daily(log_dir, "stowage-inspect.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::fmt().with_writer(non_blocking).init();

    // No local types: everything stored is read through reconstruction
    let mut store = Stowage::try_open(&cli.file, TypeTable::new(), InlinePolicy::default()).await?;

    match cli.parameter {
        Some(parameter) => process_parameter(&mut store, &parameter),
        None => interactive(&mut store).await?,
    }
    Ok(())
}
