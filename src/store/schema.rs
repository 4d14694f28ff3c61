//! Embeds the on-disk schema migrations via `sqlx::migrate!("./migrations")`,
//! run with `Migrator::run` at store startup.

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
