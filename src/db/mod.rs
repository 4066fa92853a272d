//! Fixed-size pool of pre-opened database handles, gated by a counting
//! semaphore so `acquire` blocks rather than busy-waiting when every handle
//! is checked out, plus a scope-bound RAII wrapper around that acquisition.

mod pool;
mod scoped;

pub use pool::DbPool;
pub use scoped::ScopedConn;

use crate::config::DbConfig;
use zero_mysql::sync::Conn;
use zero_mysql::Opts;

pub(crate) fn open_conn(cfg: &DbConfig) -> Option<Conn> {
    let url = format!(
        "mysql://{user}:{pwd}@{host}:{port}/{db}",
        user = cfg.user,
        pwd = cfg.password,
        host = cfg.host,
        port = cfg.port,
        db = cfg.database,
    );
    let opts = Opts::try_from(url.as_str()).ok()?;
    match Conn::new(opts) {
        Ok(conn) => Some(conn),
        Err(e) => {
            proxy_log::error!("MySql Connect error: {e}");
            None
        }
    }
}

/// Checks or creates a `user` row for the given credentials, using a
/// parameterized query in place of the source's string-concatenated SQL.
///
/// Registration (`is_login == false`) succeeds iff no row exists yet, and
/// inserts one. Login succeeds iff a row exists and its password matches.
/// Empty username or password is always a failure, and a missing pool
/// handle (pool exhaustion) is treated as a failure rather than a panic.
pub fn verify_user(pool: &DbPool, username: &str, password: &str, is_login: bool) -> bool {
    if username.is_empty() || password.is_empty() {
        return false;
    }
    let Some(mut scoped) = ScopedConn::acquire(pool) else {
        proxy_log::error!("verify_user: database pool exhausted");
        return false;
    };
    let conn = scoped.get_mut();

    let Ok(mut select_stmt) =
        conn.prepare("SELECT username, password FROM user WHERE username = ? LIMIT 1")
    else {
        return false;
    };
    // (username, password) — a plain tuple of `String`s is enough to decode
    // the row; zero-mysql implements `FromRawRow` for tuples up to 9 columns
    // but its `FromRow` derive targets a different (reference-row) trait.
    let rows: Vec<(String, String)> = match conn.exec_rows(&mut select_stmt, (username,)) {
        Ok(rows) => rows,
        Err(e) => {
            proxy_log::error!("verify_user: SELECT failed: {e}");
            return false;
        }
    };

    match rows.into_iter().next() {
        Some((_stored_username, stored_password)) => {
            if is_login {
                stored_password == password
            } else {
                false // "user used"
            }
        }
        None => {
            if is_login {
                return false;
            }
            let Ok(mut insert_stmt) =
                conn.prepare("INSERT INTO user (username, password) VALUES (?, ?)")
            else {
                return false;
            };
            match conn.exec_drop(&mut insert_stmt, (username, password)) {
                Ok(()) => true,
                Err(e) => {
                    proxy_log::error!("verify_user: INSERT failed: {e}");
                    false
                }
            }
        }
    }
}
