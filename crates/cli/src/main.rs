use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use lumen_core::{CacheConfig, ChangeDescriptor, ChangeKind, DataSource, Document, Identity, QueryParams, SortKey};
use lumen_feed::{run_feed, MemoryCollection};
use lumen_store::Registry;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "lumenctl", version, about = "Lumen live query cache CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Args, Debug, Clone)]
struct QueryArgs {
    /// Filter document, e.g. '{"status": {"$in": ["open", "held"]}}'
    #[arg(long = "filter", default_value = "{}")]
    filter: String,
    /// Max documents (0 = unlimited)
    #[arg(long = "limit", default_value_t = 0)]
    limit: u64,
    #[arg(long = "skip", default_value_t = 0)]
    skip: u64,
    /// Sort key, repeatable: "field", "-field" or "field:desc"
    #[arg(long = "sort")]
    sort: Vec<String>,
}

impl QueryArgs {
    fn params(&self) -> Result<QueryParams> {
        let filter: Value = serde_json::from_str(&self.filter).context("parsing --filter")?;
        if !filter.is_object() {
            bail!("--filter must be a JSON object");
        }
        let mut params = QueryParams::new(filter).with_limit(self.limit).with_skip(self.skip);
        if !self.sort.is_empty() {
            let keys = self
                .sort
                .iter()
                .map(|s| SortKey::parse(s).ok_or_else(|| anyhow!("invalid --sort {:?}", s)))
                .collect::<Result<Vec<_>>>()?;
            params = params.with_sort(keys);
        }
        Ok(params)
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the cache key for a query
    Fingerprint {
        #[command(flatten)]
        query: QueryArgs,
    },
    /// Keep a query live over an in-memory collection driven from stdin
    Live {
        /// JSON array of seed documents
        #[arg(long = "seed")]
        seed: Option<std::path::PathBuf>,
        /// Override LUMEN_DEBOUNCE_MS
        #[arg(long = "debounce-ms")]
        debounce_ms: Option<u64>,
        #[command(flatten)]
        query: QueryArgs,
    },
}

fn init_tracing() {
    let env = std::env::var("LUMEN_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("LUMEN_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid LUMEN_METRICS_ADDR; expected host:port");
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Command {
    Insert(Document),
    Update(Value, Document),
    Delete(Value),
    Find,
    Quit,
}

/// Ids are JSON when they parse as JSON, bare strings otherwise.
fn parse_id(s: &str) -> Value { serde_json::from_str(s).unwrap_or_else(|_| Value::String(s.to_string())) }

fn parse_command(line: &str) -> Result<Option<Command>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let (verb, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let rest = rest.trim();
    let cmd = match verb {
        "insert" => Command::Insert(serde_json::from_str(rest).context("insert <json>")?),
        "update" => {
            let (id, doc) = rest.split_once(char::is_whitespace).ok_or_else(|| anyhow!("usage: update <id> <json>"))?;
            Command::Update(parse_id(id), serde_json::from_str(doc.trim()).context("update <id> <json>")?)
        }
        "delete" if !rest.is_empty() => Command::Delete(parse_id(rest)),
        "delete" => bail!("usage: delete <id>"),
        "find" => Command::Find,
        "quit" | "exit" => Command::Quit,
        other => bail!("unknown command {:?} (insert|update|delete|find|quit)", other),
    };
    Ok(Some(cmd))
}

fn print_list(output: Output, list: &[Document]) -> Result<()> {
    match output {
        Output::Human => {
            for (i, d) in list.iter().enumerate() {
                println!("{:>4}  {}", i, d);
            }
            println!("({} documents)", list.len());
        }
        Output::Json => println!("{}", serde_json::to_string(list)?),
    }
    Ok(())
}

fn render_change(output: Output, list: &[Document], desc: &ChangeDescriptor) -> String {
    match output {
        Output::Human => {
            let sign = match desc.operation { ChangeKind::Insert => '+', ChangeKind::Update => '~', ChangeKind::Delete => '-' };
            match &desc.document {
                Some(d) => format!("{} @{} {}  (len {})", sign, desc.position, d, list.len()),
                None => format!("{} @{}  (len {})", sign, desc.position, list.len()),
            }
        }
        Output::Json => serde_json::json!({ "change": desc, "len": list.len() }).to_string(),
    }
}

async fn live(output: Output, seed: Option<std::path::PathBuf>, debounce_ms: Option<u64>, query: QueryArgs) -> Result<()> {
    let mut cfg = CacheConfig::from_env();
    if let Some(ms) = debounce_ms {
        cfg = cfg.with_debounce(Duration::from_millis(ms));
    }
    let params = query.params()?;
    let coll = Arc::new(MemoryCollection::new(Identity::canonical(cfg.id_field.clone())));
    let registry = Registry::new(Arc::clone(&coll) as Arc<dyn DataSource>, cfg)?;
    if let Some(path) = seed {
        let text = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        let docs: Vec<Document> = serde_json::from_str(&text).context("seed must be a JSON array of documents")?;
        let n = docs.len();
        coll.seed(docs)?;
        info!(path = %path.display(), docs = n, "seeded");
    }

    let fp = params.fingerprint();
    let sub = registry
        .subscribe_and_wait(params, move |list, _ev, desc| println!("{}", render_change(output, list, desc)))
        .await?;
    let feed = run_feed(registry.clone());

    let mut faults = registry.errors();
    let fault_task = tokio::spawn(async move {
        while let Ok(f) = faults.recv().await {
            eprintln!("fault: {}", f.error);
        }
    });

    match output {
        Output::Human => println!("live query {}", fp),
        Output::Json => println!("{}", serde_json::json!({ "fingerprint": fp })),
    }
    if let Some(list) = registry.find(&fp) {
        print_list(output, &list)?;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let res = match parse_command(&line) {
                    Ok(None) => Ok(()),
                    Ok(Some(Command::Quit)) => break,
                    Ok(Some(Command::Find)) => match registry.find(&fp) {
                        Some(list) => print_list(output, &list),
                        None => Ok(()),
                    },
                    Ok(Some(Command::Insert(doc))) => coll.insert(doc).map(|id| info!(id = %id, "inserted")),
                    Ok(Some(Command::Update(id, doc))) => coll.update(&id, doc),
                    Ok(Some(Command::Delete(id))) => coll.delete(&id).map(|_| ()),
                    Err(e) => Err(e),
                };
                if let Err(e) = res {
                    eprintln!("error: {:#}", e);
                }
            }
            _ = signal::ctrl_c() => {
                info!("Ctrl-C received; shutting down live session");
                break;
            }
        }
    }

    registry.unsubscribe(sub);
    feed.cancel();
    fault_task.abort();
    warn!("live session ended");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Fingerprint { query } => {
            let params = query.params()?;
            let fp = params.fingerprint();
            info!(fp = %fp.short(), "fingerprint computed");
            match cli.output {
                Output::Human => println!("{}", fp),
                Output::Json => println!("{}", serde_json::to_string_pretty(&serde_json::json!({ "fingerprint": fp, "params": params }))?),
            }
        }
        Commands::Live { seed, debounce_ms, query } => live(cli.output, seed, debounce_ms, query).await?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_session_commands() {
        assert_eq!(parse_command("  ").unwrap(), None);
        assert_eq!(parse_command("insert {\"a\": 1}").unwrap(), Some(Command::Insert(json!({"a": 1}))));
        assert_eq!(parse_command("update 7 {\"a\": 2}").unwrap(), Some(Command::Update(json!(7), json!({"a": 2}))));
        assert_eq!(parse_command("delete abc").unwrap(), Some(Command::Delete(json!("abc"))));
        assert_eq!(parse_command("find").unwrap(), Some(Command::Find));
        assert_eq!(parse_command("quit").unwrap(), Some(Command::Quit));
    }

    #[test]
    fn rejects_bad_commands() {
        assert!(parse_command("delete").is_err());
        assert!(parse_command("update 7").is_err());
        assert!(parse_command("insert {oops").is_err());
        assert!(parse_command("drop all").is_err());
    }

    #[test]
    fn query_args_build_params() {
        let q = QueryArgs { filter: r#"{"a": 1}"#.into(), limit: 5, skip: 1, sort: vec!["-b".into(), "c".into()] };
        let p = q.params().unwrap();
        assert_eq!(p.limit, 5);
        assert_eq!(p.sort.unwrap(), vec![SortKey::desc("b"), SortKey::asc("c")]);
        let bad = QueryArgs { filter: "[1]".into(), limit: 0, skip: 0, sort: vec![] };
        assert!(bad.params().is_err());
    }
}
