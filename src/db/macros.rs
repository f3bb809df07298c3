//! Backend adapter macros for reducing code duplication.
//!
//! The three sqlx adapters differ only in their connection type, their bind
//! function and a handful of engine-specific statements. This module provides
//! a declarative macro that generates the shared part of each
//! [`RawConnection`](crate::db::backend::RawConnection) implementation while
//! maintaining linear readability.

/// Implement `RawConnection` for a struct with a `conn` field holding a sqlx
/// connection.
///
/// # Example
///
/// ```ignore
/// impl_raw_connection!(PgLink, bind_postgres_value, {
///     async fn advisory_lock(&mut self, key: i64) -> DbResult<()> { ... }
/// });
/// ```
macro_rules! impl_raw_connection {
    ($link:ty, $bind:path, { $($extra:tt)* }) => {
        #[async_trait::async_trait]
        impl $crate::db::backend::RawConnection for $link {
            async fn execute(
                &mut self,
                sql: &str,
                args: &[$crate::models::Value],
            ) -> $crate::error::DbResult<u64> {
                let mut query = sqlx::query(sql);
                for arg in args {
                    query = $bind(query, arg);
                }
                let result = query.execute(&mut self.conn).await?;
                Ok(result.rows_affected())
            }

            async fn execute_script(&mut self, sql: &str) -> $crate::error::DbResult<()> {
                use sqlx::Executor as _;
                (&mut self.conn).execute(sql).await?;
                Ok(())
            }

            async fn fetch_all(
                &mut self,
                sql: &str,
                args: &[$crate::models::Value],
            ) -> $crate::error::DbResult<Vec<$crate::models::Row>> {
                use $crate::db::types::DecodeRow as _;

                let mut query = sqlx::query(sql);
                for arg in args {
                    query = $bind(query, arg);
                }
                let rows = query.fetch_all(&mut self.conn).await?;
                let Some(first) = rows.first() else {
                    return Ok(Vec::new());
                };
                let columns: std::sync::Arc<[$crate::models::Column]> =
                    first.columns_meta().into();
                rows.iter().map(|row| row.decode_row(&columns)).collect()
            }

            fn fetch_stream<'a>(
                &'a mut self,
                sql: &'a str,
                args: &'a [$crate::models::Value],
            ) -> futures_util::stream::BoxStream<'a, $crate::error::DbResult<$crate::models::Row>> {
                use $crate::db::types::DecodeRow as _;
                use futures_util::StreamExt as _;

                let mut query = sqlx::query(sql);
                for arg in args {
                    query = $bind(query, arg);
                }
                let mut columns: Option<std::sync::Arc<[$crate::models::Column]>> = None;
                query
                    .fetch(&mut self.conn)
                    .map(move |row| {
                        let row = row?;
                        let columns = columns
                            .get_or_insert_with(|| row.columns_meta().into())
                            .clone();
                        row.decode_row(&columns)
                    })
                    .boxed()
            }

            async fn ping(&mut self) -> $crate::error::DbResult<()> {
                use sqlx::Connection as _;
                self.conn.ping().await?;
                Ok(())
            }

            async fn close(self: Box<Self>) -> $crate::error::DbResult<()> {
                use sqlx::Connection as _;
                self.conn.close().await?;
                Ok(())
            }

            $($extra)*
        }
    };
}
