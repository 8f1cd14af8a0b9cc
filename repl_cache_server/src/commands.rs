//! Client command dispatch onto a [`Cache`]

use repl_cache_core::cache::{Cache, WriteOptions};
use repl_cache_core::query::{QueryDescriptor, QueryResult};
use repl_cache_core::replication::ReplicationMode;
use repl_cache_core::{CacheError, Predicate};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::protocol::{RespCommand, RespValue};

pub async fn process_command<C: Cache + ?Sized>(cache: &C, cmd: RespCommand) -> RespValue {
    let result = match cmd.command.as_str() {
        "PING" => Ok(RespValue::SimpleString("PONG".to_string())),
        "GET" => get(cache, &cmd.args).await,
        "PUT" => put(cache, &cmd.args).await,
        "PUTNX" => put_if_absent(cache, &cmd.args).await,
        "REPLACE" => replace(cache, &cmd.args).await,
        "CAS" => compare_and_swap(cache, &cmd.args).await,
        "DEL" => remove(cache, &cmd.args).await,
        "DELIF" => remove_if(cache, &cmd.args).await,
        "MPUT" => put_all(cache, &cmd.args).await,
        "EXISTS" => contains_key(cache, &cmd.args).await,
        "EVICT" => evict(cache, &cmd.args).await,
        "SIZE" => cache.size().await.map(|n| RespValue::Integer(n as i64)).map_err(CommandError::from),
        "EMPTY" => cache.is_empty().await.map(|b| RespValue::Integer(b as i64)).map_err(CommandError::from),
        "KEYS" => keys(cache).await,
        "CLEAR" => clear(cache, &cmd.args).await,
        "QUERY" => query(cache, &cmd.args).await,
        "TOPOLOGY" => Ok(topology(cache)),
        other => Err(CommandError::Usage(format!("unknown command '{}'", other))),
    };
    match result {
        Ok(value) => value,
        Err(CommandError::Usage(msg)) => RespValue::error(format!("ERR {}", msg)),
        Err(CommandError::Cache(e)) => RespValue::error(format!("{} {}", e.kind(), e)),
    }
}

enum CommandError {
    Usage(String),
    Cache(CacheError),
}

impl From<CacheError> for CommandError {
    fn from(err: CacheError) -> Self {
        CommandError::Cache(err)
    }
}

type CommandResult = Result<RespValue, CommandError>;

fn arity(args: &[String], min: usize, usage: &str) -> Result<(), CommandError> {
    if args.len() < min {
        return Err(CommandError::Usage(format!("usage: {}", usage)));
    }
    Ok(())
}

/// Trailing write options: `EX <secs>`, `PX <ms>`, `SYNC`, `ASYNC`
fn write_options(args: &[String]) -> Result<WriteOptions, CommandError> {
    let mut options = WriteOptions::default();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.to_uppercase().as_str() {
            "EX" | "PX" => {
                let amount = iter
                    .next()
                    .and_then(|v| v.parse::<u64>().ok())
                    .ok_or_else(|| CommandError::Usage(format!("{} needs a number", arg)))?;
                let expiry = if arg.eq_ignore_ascii_case("EX") {
                    Duration::from_secs(amount)
                } else {
                    Duration::from_millis(amount)
                };
                options = options.with_expiry(expiry);
            }
            mode => {
                let mode: ReplicationMode = mode
                    .parse()
                    .map_err(|_| CommandError::Usage(format!("unknown option '{}'", arg)))?;
                options = options.with_mode(mode);
            }
        }
    }
    Ok(options)
}

async fn get<C: Cache + ?Sized>(cache: &C, args: &[String]) -> CommandResult {
    arity(args, 1, "GET key")?;
    Ok(RespValue::from_option(cache.get(&args[0]).await?))
}

async fn put<C: Cache + ?Sized>(cache: &C, args: &[String]) -> CommandResult {
    arity(args, 2, "PUT key value [EX secs|PX ms] [SYNC|ASYNC]")?;
    let options = write_options(&args[2..])?;
    Ok(RespValue::from_option(cache.put(&args[0], args[1].clone(), options).await?))
}

async fn put_if_absent<C: Cache + ?Sized>(cache: &C, args: &[String]) -> CommandResult {
    arity(args, 2, "PUTNX key value [options]")?;
    let options = write_options(&args[2..])?;
    Ok(RespValue::from_option(
        cache.put_if_absent(&args[0], args[1].clone(), options).await?,
    ))
}

async fn replace<C: Cache + ?Sized>(cache: &C, args: &[String]) -> CommandResult {
    arity(args, 2, "REPLACE key value [options]")?;
    let options = write_options(&args[2..])?;
    Ok(RespValue::from_option(cache.replace(&args[0], args[1].clone(), options).await?))
}

async fn compare_and_swap<C: Cache + ?Sized>(cache: &C, args: &[String]) -> CommandResult {
    arity(args, 3, "CAS key expected value [options]")?;
    let options = write_options(&args[3..])?;
    let swapped = cache.replace_if(&args[0], &args[1], args[2].clone(), options).await?;
    Ok(RespValue::Integer(swapped as i64))
}

async fn remove<C: Cache + ?Sized>(cache: &C, args: &[String]) -> CommandResult {
    arity(args, 1, "DEL key [SYNC|ASYNC]")?;
    let options = write_options(&args[1..])?;
    Ok(RespValue::from_option(cache.remove(&args[0], options).await?))
}

async fn remove_if<C: Cache + ?Sized>(cache: &C, args: &[String]) -> CommandResult {
    arity(args, 2, "DELIF key expected [SYNC|ASYNC]")?;
    let options = write_options(&args[2..])?;
    let removed = cache.remove_if(&args[0], &args[1], options).await?;
    Ok(RespValue::Integer(removed as i64))
}

/// `MPUT key value [key value ...]`, written with the configured mode
async fn put_all<C: Cache + ?Sized>(cache: &C, args: &[String]) -> CommandResult {
    if args.is_empty() || args.len() % 2 != 0 {
        return Err(CommandError::Usage("usage: MPUT key value [key value ...]".to_string()));
    }
    let entries: BTreeMap<String, String> = args
        .chunks(2)
        .map(|pair| (pair[0].clone(), pair[1].clone()))
        .collect();
    cache.put_all(entries, WriteOptions::default()).await?;
    Ok(RespValue::ok())
}

async fn contains_key<C: Cache + ?Sized>(cache: &C, args: &[String]) -> CommandResult {
    arity(args, 1, "EXISTS key")?;
    Ok(RespValue::Integer(cache.contains_key(&args[0]).await? as i64))
}

async fn evict<C: Cache + ?Sized>(cache: &C, args: &[String]) -> CommandResult {
    arity(args, 1, "EVICT key")?;
    Ok(RespValue::Integer(cache.evict(&args[0]).await? as i64))
}

async fn keys<C: Cache + ?Sized>(cache: &C) -> CommandResult {
    let keys = cache.key_set().await?;
    Ok(RespValue::Array(keys.into_iter().map(RespValue::bulk).collect()))
}

async fn clear<C: Cache + ?Sized>(cache: &C, args: &[String]) -> CommandResult {
    let options = write_options(args)?;
    Ok(RespValue::Integer(cache.clear(options).await? as i64))
}

/// `QUERY <terms...> [LIMIT n] [TIMEOUT ms] [ORDERED] [FIRST]`
///
/// Replies with the status line, then key/value pairs, then any nodes that
/// did not answer.
async fn query<C: Cache + ?Sized>(cache: &C, args: &[String]) -> CommandResult {
    arity(args, 1, "QUERY terms... [LIMIT n] [TIMEOUT ms] [ORDERED] [FIRST]")?;

    let mut terms = Vec::new();
    let mut limit = None;
    let mut timeout = None;
    let mut ordered = false;
    let mut early = false;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.to_uppercase().as_str() {
            "LIMIT" => limit = Some(number(iter.next(), "LIMIT")?),
            "TIMEOUT" => timeout = Some(Duration::from_millis(number(iter.next(), "TIMEOUT")? as u64)),
            "ORDERED" => ordered = true,
            "FIRST" => early = true,
            _ => terms.push(arg.as_str()),
        }
    }
    let predicate: Predicate = terms.join(" ").parse().map_err(CommandError::Usage)?;

    let mut descriptor = QueryDescriptor::new(predicate);
    if let Some(limit) = limit {
        descriptor = descriptor.with_limit(limit);
    }
    if let Some(timeout) = timeout {
        descriptor = descriptor.with_timeout(timeout);
    }
    if ordered {
        descriptor = descriptor.ordered_by_key();
    }
    if early {
        descriptor = descriptor.with_early_termination();
    }

    Ok(query_reply(cache.run_query(descriptor).await))
}

fn number(arg: Option<&String>, name: &str) -> Result<usize, CommandError> {
    arg.and_then(|v| v.parse().ok())
        .ok_or_else(|| CommandError::Usage(format!("{} needs a number", name)))
}

fn query_reply(result: QueryResult) -> RespValue {
    let status = if result.is_complete() { "COMPLETE" } else { "PARTIAL" };
    let pairs = result
        .entries
        .into_iter()
        .map(|e| RespValue::Array(vec![RespValue::bulk(e.key), RespValue::bulk(e.value)]))
        .collect();
    let failed = result
        .failed
        .iter()
        .map(|id| RespValue::bulk(id.as_str()))
        .collect();
    RespValue::Array(vec![
        RespValue::SimpleString(status.to_string()),
        RespValue::Array(pairs),
        RespValue::Array(failed),
    ])
}

fn topology<C: Cache + ?Sized>(cache: &C) -> RespValue {
    let view = cache.current_topology();
    let members = view
        .members()
        .iter()
        .map(|m| RespValue::bulk(format!("{} {} {}", m.id, m.address, m.topology)))
        .collect();
    RespValue::Array(vec![RespValue::Integer(view.view_id() as i64), RespValue::Array(members)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::parse_command;
    use repl_cache_core::config::CacheConfig;
    use repl_cache_core::metrics::MetricsCollector;
    use repl_cache_core::transport::LocalNetwork;
    use repl_cache_core::{ClusterNode, MemoryStore};
    use std::sync::Arc;

    fn node() -> Arc<ClusterNode> {
        let mut config = CacheConfig::default();
        config.cluster.node_id = "cmd".to_string();
        ClusterNode::new(
            config,
            Arc::new(MemoryStore::new()),
            Arc::new(LocalNetwork::new().transport_for("cmd".into())),
            Arc::new(MetricsCollector::default()),
        )
        .unwrap()
    }

    async fn run(node: &ClusterNode, line: &str) -> RespValue {
        process_command(node, parse_command(line).unwrap()).await
    }

    #[tokio::test]
    async fn test_write_commands() {
        let node = node();
        assert_eq!(run(&node, "PING").await, RespValue::SimpleString("PONG".into()));
        assert_eq!(run(&node, "PUT a 1").await, RespValue::null());
        assert_eq!(run(&node, "PUT a 2 SYNC").await, RespValue::bulk("1"));
        assert_eq!(run(&node, "PUTNX a 3").await, RespValue::bulk("2"));
        assert_eq!(run(&node, "CAS a 2 4").await, RespValue::Integer(1));
        assert_eq!(run(&node, "CAS a 2 5").await, RespValue::Integer(0));
        assert_eq!(run(&node, "REPLACE missing x").await, RespValue::null());
        assert_eq!(run(&node, "GET a").await, RespValue::bulk("4"));
        assert_eq!(run(&node, "DELIF a 9").await, RespValue::Integer(0));
        assert_eq!(run(&node, "DEL a").await, RespValue::bulk("4"));
        assert_eq!(run(&node, "GET a").await, RespValue::null());
    }

    #[tokio::test]
    async fn test_bulk_commands() {
        let node = node();
        assert_eq!(run(&node, "EMPTY").await, RespValue::Integer(1));
        assert_eq!(run(&node, "MPUT b 2 a 1 c 3").await, RespValue::ok());
        assert_eq!(run(&node, "SIZE").await, RespValue::Integer(3));
        assert_eq!(run(&node, "EMPTY").await, RespValue::Integer(0));
        assert_eq!(
            run(&node, "KEYS").await,
            RespValue::Array(vec![RespValue::bulk("a"), RespValue::bulk("b"), RespValue::bulk("c")])
        );
        assert_eq!(run(&node, "EXISTS b").await, RespValue::Integer(1));
        assert_eq!(run(&node, "EVICT b").await, RespValue::Integer(1));
        assert_eq!(run(&node, "EXISTS b").await, RespValue::Integer(0));
        assert_eq!(run(&node, "CLEAR SYNC").await, RespValue::Integer(2));
        assert_eq!(run(&node, "SIZE").await, RespValue::Integer(0));
        assert!(matches!(run(&node, "MPUT a 1 b").await, RespValue::Error(e) if e.contains("usage")));
    }

    #[tokio::test]
    async fn test_query_command() {
        let node = node();
        run(&node, "PUT k2 apple").await;
        run(&node, "PUT k1 avocado").await;
        run(&node, "PUT k3 banana").await;

        let reply = run(&node, "QUERY value^a ORDERED").await;
        let expected = RespValue::Array(vec![
            RespValue::SimpleString("COMPLETE".into()),
            RespValue::Array(vec![
                RespValue::Array(vec![RespValue::bulk("k1"), RespValue::bulk("avocado")]),
                RespValue::Array(vec![RespValue::bulk("k2"), RespValue::bulk("apple")]),
            ]),
            RespValue::Array(vec![]),
        ]);
        assert_eq!(reply, expected);
    }

    #[tokio::test]
    async fn test_errors() {
        let node = node();
        assert!(matches!(run(&node, "FLY away").await, RespValue::Error(e) if e.starts_with("ERR")));
        assert!(matches!(run(&node, "PUT onlykey").await, RespValue::Error(e) if e.contains("usage")));
        assert!(matches!(run(&node, "PUT k v EX soon").await, RespValue::Error(_)));
        assert!(matches!(run(&node, "QUERY bogus").await, RespValue::Error(_)));
    }

    #[tokio::test]
    async fn test_topology_command() {
        let node = node();
        match run(&node, "TOPOLOGY").await {
            RespValue::Array(parts) => {
                assert_eq!(parts[0], RespValue::Integer(1));
                assert!(matches!(&parts[1], RespValue::Array(m) if m.len() == 1));
            }
            other => panic!("unexpected reply {:?}", other),
        }
    }
}
