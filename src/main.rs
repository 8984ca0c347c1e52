use anyhow::{anyhow, Context, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use rust_block_db::{
    engine::{ColumnType, Database},
    sql::ParamValue,
    DatabaseConfig,
};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

/// Command-line front end for a database directory.
///
/// # Subcommands
/// - `tables`: list registered tables
/// - `create NAME COL:TYPE...`: create a table
/// - `drop NAME`: drop a table and delete its file
/// - `query SQL [--param VALUE]...`: run a statement, printing JSON
///
/// # Example Usage
/// ```text
/// rust_block_db --data ./dbdata create users id:BIGINT name:VARCHAR(32)
/// rust_block_db --data ./dbdata query "INSERT INTO users VALUES (?, ?)" --param 1 --param Ada
/// rust_block_db --data ./dbdata query "SELECT * FROM users WHERE id = 1"
/// ```
fn main() -> Result<()> {
    let matches = cli().get_matches();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    let data_dir = matches
        .get_one::<String>("data")
        .ok_or_else(|| anyhow!("--data is required"))?;
    let mut config = match matches.get_one::<String>("config") {
        Some(file) => DatabaseConfig::from_file(file)
            .with_context(|| format!("reading config {file}"))?,
        None => DatabaseConfig::new(data_dir),
    };
    config.path = data_dir.into();
    if matches.get_flag("remove-on-error") {
        config.remove_on_error = true;
    }

    let db = Database::open(config)?;
    let outcome = run(&db, &matches);
    db.close();
    outcome
}

fn cli() -> Command {
    Command::new("rust_block_db")
        .about("Embedded block-structured table store with a small SQL engine")
        .arg(Arg::new("data")
            .long("data")
            .value_name("DIR")
            .required(true)
            .help("Directory holding one <table>.db file per table"))
        .arg(Arg::new("config")
            .long("config")
            .value_name("FILE")
            .help("JSON configuration file; --data overrides its path"))
        .arg(Arg::new("remove-on-error")
            .long("remove-on-error")
            .action(ArgAction::SetTrue)
            .help("Delete table files that fail to load"))
        .subcommand_required(true)
        .subcommand(Command::new("tables").about("List tables"))
        .subcommand(Command::new("create")
            .about("Create a table")
            .arg(Arg::new("name").required(true))
            .arg(Arg::new("columns")
                .value_name("COL:TYPE")
                .required(true)
                .num_args(1..)))
        .subcommand(Command::new("drop")
            .about("Drop a table")
            .arg(Arg::new("name").required(true)))
        .subcommand(Command::new("query")
            .about("Run a SELECT or INSERT")
            .arg(Arg::new("sql").required(true))
            .arg(Arg::new("param")
                .long("param")
                .value_name("VALUE")
                .action(ArgAction::Append)
                .help("Positional parameter: null, true, false, a number, or text")))
}

fn run(db: &Database, matches: &ArgMatches) -> Result<()> {
    match matches.subcommand() {
        Some(("tables", _)) => {
            for name in db.table_names() {
                println!("{name}");
            }
        }
        Some(("create", sub)) => {
            let name = sub
                .get_one::<String>("name")
                .ok_or_else(|| anyhow!("table name required"))?;
            let mut factory = db.create_table_factory();
            factory.start_table(name);
            for spec in sub.get_many::<String>("columns").into_iter().flatten() {
                let (col, ty) = spec
                    .split_once(':')
                    .ok_or_else(|| anyhow!("column must be NAME:TYPE, got '{spec}'"))?;
                factory.add_column(col, ty.parse::<ColumnType>()?)?;
            }
            let table = db.add_table(factory.create()?)?;
            info!(table = %table.name(), "created");
        }
        Some(("drop", sub)) => {
            let name = sub
                .get_one::<String>("name")
                .ok_or_else(|| anyhow!("table name required"))?;
            db.drop_table(name)?;
        }
        Some(("query", sub)) => {
            let sql = sub
                .get_one::<String>("sql")
                .ok_or_else(|| anyhow!("SQL required"))?;
            let params: Vec<ParamValue> = sub
                .get_many::<String>("param")
                .into_iter()
                .flatten()
                .map(|p| parse_param(p.as_str()))
                .collect();
            let result = db.execute(sql, &params)?;
            println!("{}", serde_json::to_string_pretty(&result.to_json())?);
        }
        _ => return Err(anyhow!("unknown subcommand")),
    }
    Ok(())
}

fn parse_param(raw: &str) -> ParamValue {
    match raw {
        "null" | "NULL" => ParamValue::Null,
        "true" | "TRUE" => ParamValue::Boolean(true),
        "false" | "FALSE" => ParamValue::Boolean(false),
        _ => {
            if let Ok(v) = raw.parse::<i64>() {
                ParamValue::Long(v)
            } else if let Ok(v) = raw.parse::<f64>() {
                ParamValue::Double(v)
            } else {
                ParamValue::Str(raw.to_string())
            }
        }
    }
}
