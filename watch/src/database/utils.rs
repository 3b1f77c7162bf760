use crate::database::{config::Config, error::Error};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::sql_types::Text;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use log::info;

#[derive(QueryableByName)]
struct DatabaseName {
    #[diesel(sql_type = Text)]
    #[allow(dead_code)]
    datname: String,
}

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

/// Sets `config.dbname` to `config.default_dbname` and returns `(new_config, old_dbname)`.
///
/// This is useful for creating databases, since this must be done by logging into another
/// database.
pub fn get_config_using_default_db(config: &Config) -> (Config, String) {
    let mut config = config.clone();
    let new_dbname = std::mem::replace(&mut config.dbname, config.default_dbname.clone());
    (config, new_dbname)
}

/// Creates `config.dbname` if it does not exist yet.
pub fn create_database_if_missing(config: &Config) -> Result<(), Error> {
    let (default_config, dbname) = get_config_using_default_db(config);
    let mut conn = PgConnection::establish(&default_config.build_database_url())?;

    let exists = !diesel::sql_query("SELECT datname FROM pg_database WHERE datname = $1")
        .bind::<Text, _>(&dbname)
        .load::<DatabaseName>(&mut conn)?
        .is_empty();

    if !exists {
        info!("Creating database {}", dbname);
        diesel::sql_query(format!("CREATE DATABASE \"{}\"", dbname.replace('"', "\"\"")))
            .execute(&mut conn)?;
    }
    Ok(())
}

/// Runs every migration not yet applied to `config.dbname`.
/// Equivalent to `diesel migration run`.
pub fn run_migrations(config: &Config) -> Result<(), Error> {
    let mut conn = PgConnection::establish(&config.build_database_url())?;
    let applied = conn
        .run_pending_migrations(MIGRATIONS)
        .map_err(|e| Error::Migration(e.to_string()))?;

    for migration in applied {
        info!("Applied migration {}", migration);
    }
    Ok(())
}
