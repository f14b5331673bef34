use anyhow::{bail, Context, Result};
use askdb::config::{self, Settings, PASSWORD_ENV};
use askdb::db::ConnectionDescriptor;
use askdb::{export, parser, Dialect};
use clap::{Parser, Subcommand, ValueEnum};
use std::io::Read;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Introspect databases and run model-generated SQL or MongoDB operations
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List saved connections
    Connections,
    /// Print the schema of a saved connection as JSON
    Schema {
        #[arg(long, short)]
        connection: String,
    },
    /// Print table count and size
    Stats {
        #[arg(long, short)]
        connection: String,
    },
    /// Connect and ping
    Test {
        #[arg(long, short)]
        connection: String,
    },
    /// Parse generated text and print the operation as JSON
    Parse {
        #[arg(long, value_enum)]
        dialect: DialectArg,
        /// Read from this file instead of stdin
        file: Option<PathBuf>,
    },
    /// Parse generated text for a connection, execute it and print the rows
    Run {
        #[arg(long, short)]
        connection: String,
        #[arg(long, short, value_enum, default_value_t = Format::Table)]
        format: Format,
        /// Read from this file instead of stdin
        file: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum DialectArg {
    Sql,
    Mongo,
}

impl From<DialectArg> for Dialect {
    fn from(arg: DialectArg) -> Self {
        match arg {
            DialectArg::Sql => Dialect::Sql,
            DialectArg::Mongo => Dialect::Mongo,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Json,
    Csv,
    Table,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let cli = Cli::parse();
    let settings = Settings::load()?;

    match cli.command {
        Command::Connections => {
            let saved = config::load_saved_connections()?;
            if saved.is_empty() {
                eprintln!("No saved connections in {}", config::connections_path().display());
            }
            for c in saved {
                println!("{}\t{}\t{}", c.name, c.backend, c.display_string());
            }
        }
        Command::Schema { connection } => {
            let descriptor = resolve_connection(&connection)?;
            let schema = askdb::fetch_schema(&descriptor, &settings).await?;
            println!("{}", serde_json::to_string_pretty(&schema)?);
        }
        Command::Stats { connection } => {
            let descriptor = resolve_connection(&connection)?;
            let stats = askdb::fetch_stats(&descriptor, &settings).await?;
            match stats.table_count {
                Some(n) => println!("tables: {}", n),
                None => println!("tables: Unknown"),
            }
            println!("size: {}", stats.size);
        }
        Command::Test { connection } => {
            let descriptor = resolve_connection(&connection)?;
            askdb::test_connection(&descriptor, &settings).await?;
            println!("{}: OK", descriptor.name);
        }
        Command::Parse { dialect, file } => {
            let text = read_input(file.as_ref())?;
            let operation = parser::parse(dialect.into(), &text)?;
            println!("{}", serde_json::to_string_pretty(&operation)?);
        }
        Command::Run {
            connection,
            format,
            file,
        } => {
            let descriptor = resolve_connection(&connection)?;
            let text = read_input(file.as_ref())?;
            let operation = parser::parse(Dialect::for_backend(descriptor.backend), &text)?;
            let output = askdb::execute(&descriptor, &settings, &operation).await?;

            let rendered = match format {
                Format::Json => export::to_json(&output.rows),
                Format::Csv => export::to_csv(&output.rows),
                Format::Table => export::to_table(&output.rows),
            };
            print!("{}", rendered);
            if !rendered.ends_with('\n') {
                println!();
            }
            eprintln!("{} rows in {}", output.row_count(), output.elapsed_display());
        }
    }

    Ok(())
}

/// Look up a saved connection and fill in its password:
/// ASKDB_PASSWORD first, then an interactive prompt.
fn resolve_connection(name: &str) -> Result<ConnectionDescriptor> {
    let saved = config::load_saved_connections()?;
    let Some(found) = config::find_connection(&saved, name) else {
        let known: Vec<&str> = saved.iter().map(|c| c.name.as_str()).collect();
        bail!(
            "no saved connection named {:?} (saved: {})",
            name,
            if known.is_empty() {
                String::from("none")
            } else {
                known.join(", ")
            }
        );
    };

    let mut descriptor = found.clone();
    if descriptor.password.is_empty()
        && !descriptor.username.is_empty()
        && descriptor.connection_uri.is_none()
    {
        if let Ok(pw) = std::env::var(PASSWORD_ENV) {
            descriptor.password = pw;
        } else {
            let prompt = format!("Password for {}: ", descriptor.display_string());
            descriptor.password = rpassword::read_password_from_tty(Some(&prompt))?;
        }
    }
    Ok(descriptor)
}

fn read_input(file: Option<&PathBuf>) -> Result<String> {
    match file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display())),
        None => {
            let mut text = String::new();
            std::io::stdin()
                .read_to_string(&mut text)
                .context("failed to read stdin")?;
            Ok(text)
        }
    }
}
