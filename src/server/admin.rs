//! Admin command handlers behind the text protocol: INFO, SHOW and
//! FLUSHDB. Each returns plain data; the text layer does the framing.

use std::sync::Arc;

use crate::engine::{LockDb, Warden};

use super::Registry;

/// The INFO report: server, clients and keyspace sections joined into one
/// bulk string.
pub(crate) fn info(warden: &Arc<Warden>, registry: &Arc<Registry>) -> String {
    let config = warden.config();
    let mut lines = Vec::new();

    lines.push("# Server".to_string());
    lines.push(format!("version:{}", env!("CARGO_PKG_VERSION")));
    lines.push(format!("process_id:{}", std::process::id()));
    lines.push(format!("tcp_bind:{}", config.bind));
    lines.push(format!("tcp_port:{}", config.port));
    lines.push(format!("uptime_in_seconds:{}", warden.uptime_secs()));
    lines.push(format!("state:{}", warden.state()));

    lines.push(String::new());
    lines.push("# Clients".to_string());
    lines.push(format!("total_clients:{}", registry.total_accepted()));
    lines.push(format!("connected_clients:{}", registry.open_connections()));

    lines.push(String::new());
    lines.push("# Keyspace".to_string());
    for db in warden.live_dbs() {
        let state = db.state();
        lines.push(format!(
            "db{}:key_count={},locked_count={},wait_count={},lock_count={},unlock_count={}",
            db.db_id(),
            state.key_count,
            state.locked_count,
            state.wait_count,
            state.lock_count,
            state.unlock_count,
        ));
    }

    lines.join("\r\n")
}

fn db_from_args(warden: &Arc<Warden>, args: &[String]) -> Result<Arc<LockDb>, String> {
    if args.len() != 2 {
        return Err("wrong number of arguments".to_string());
    }
    let db_id: u8 = args[1]
        .parse()
        .map_err(|_| "DB_ID is not a number".to_string())?;
    warden.db(db_id).ok_or_else(|| "no such db".to_string())
}

/// SHOW <db_id>: the counter block as name/value pairs.
pub(crate) fn show(warden: &Arc<Warden>, args: &[String]) -> Result<Vec<String>, String> {
    let db = db_from_args(warden, args)?;
    let state = db.state();
    Ok(vec![
        "lock_count".to_string(),
        state.lock_count.to_string(),
        "unlock_count".to_string(),
        state.unlock_count.to_string(),
        "locked_count".to_string(),
        state.locked_count.to_string(),
        "wait_count".to_string(),
        state.wait_count.to_string(),
        "timeouted_count".to_string(),
        state.timeouted_count.to_string(),
        "expried_count".to_string(),
        state.expried_count.to_string(),
        "unlock_error_count".to_string(),
        state.unlock_error_count.to_string(),
        "key_count".to_string(),
        state.key_count.to_string(),
    ])
}

/// FLUSHDB <db_id>: drops every key, holder and waiter of one database.
pub(crate) fn flush_db(warden: &Arc<Warden>, args: &[String]) -> Result<(), String> {
    if args.len() != 2 {
        return Err("wrong number of arguments".to_string());
    }
    let db_id: u8 = args[1]
        .parse()
        .map_err(|_| "DB_ID is not a number".to_string())?;
    if warden.flush_db(db_id) {
        Ok(())
    } else {
        Err("no such db".to_string())
    }
}
