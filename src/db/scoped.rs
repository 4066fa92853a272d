//! Scope-bound acquire/release around a pooled connection: `getConn` runs in
//! the constructor, `freeConn` runs in `Drop`, exactly once.

use zero_mysql::sync::Conn;

use super::DbPool;

pub struct ScopedConn<'a> {
    pool: &'a DbPool,
    conn: Option<Conn>,
}

impl<'a> ScopedConn<'a> {
    pub fn acquire(pool: &'a DbPool) -> Option<Self> {
        let conn = pool.get_conn()?;
        Some(ScopedConn {
            pool,
            conn: Some(conn),
        })
    }

    pub fn get_mut(&mut self) -> &mut Conn {
        self.conn.as_mut().expect("connection taken before drop")
    }
}

impl Drop for ScopedConn<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.free_conn(conn);
        }
    }
}
