use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StorageError {
    #[snafu(display("no {entity} with id '{id}' on `{stage}`"))]
    NotFound {
        stage: &'static str,
        entity: &'static str,
        id: String,
    },
    #[snafu(display("{entity} conflict on `{stage}`: {details}"))]
    Conflict {
        stage: &'static str,
        entity: &'static str,
        details: String,
    },
    #[snafu(display("'{raw}' is not a valid {id_type}"))]
    InvalidId {
        stage: &'static str,
        id_type: &'static str,
        raw: String,
    },
    #[snafu(display("stored data is inconsistent on `{stage}`: {details}"))]
    InvariantViolation {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("cannot encode {field} as JSON on `{stage}`: {source}"))]
    EncodeJson {
        stage: &'static str,
        field: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("stored {field} is not valid JSON on `{stage}`: {source}"))]
    DecodeJson {
        stage: &'static str,
        field: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("cannot create the database directory {path}: {source}"))]
    CreateSqliteDirectory {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("'{database_url}' is not a usable SQLite URL: {source}"))]
    SqliteConnectOptions {
        stage: &'static str,
        database_url: String,
        source: sqlx::Error,
    },
    #[snafu(display("cannot open SQLite database '{database_url}': {source}"))]
    SqliteConnect {
        stage: &'static str,
        database_url: String,
        source: sqlx::Error,
    },
    #[snafu(display("cannot set SQLite pragma {pragma}: {source}"))]
    SqlitePragma {
        stage: &'static str,
        pragma: &'static str,
        source: sqlx::Error,
    },
    #[snafu(display("schema migration failed: {source}"))]
    SqliteMigrate {
        stage: &'static str,
        source: sqlx::migrate::MigrateError,
    },
    #[snafu(display("SQLite query failed on `{stage}`: {source}"))]
    SqliteQuery {
        stage: &'static str,
        source: sqlx::Error,
    },
}

pub type StorageResult<T> = Result<T, StorageError>;
