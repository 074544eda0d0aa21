use std::fmt;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use relay_config::shared::ConnectionConfig;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{Map, Value};
use tiberius::numeric::Numeric;
use tiberius::{AuthMethod, Client, Config, EncryptionLevel, Row, ToSql};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ErrorKind, RelayResult};
use crate::source::{ChangeLog, ChangeRow, ChangeSource, LogChangeSource, SourceFactory};
use crate::types::{LSN_SIZE, Lsn};
use crate::{bail, relay_error};

const DEFAULT_PORT: u16 = 1433;

const DEFAULT_APPLICATION_NAME: &str = "relay";

/// Prefix of the metadata columns returned alongside the captured ones.
const METADATA_COLUMN_PREFIX: &str = "__$";

/// Maximum length of a SQL Server identifier.
const MAX_IDENTIFIER_LENGTH: usize = 128;

/// Parameters of a `SqlServer` connection.
///
/// This intentionally does not implement `Serialize` to avoid leaking the password.
#[derive(Debug, Clone, Deserialize)]
pub struct SqlServerParameters {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: SecretString,
    #[serde(default = "default_true")]
    pub encrypt: bool,
    #[serde(default)]
    pub trust_server_certificate: bool,
    #[serde(default = "default_application_name")]
    pub application_name: String,
}

impl SqlServerParameters {
    fn to_tiberius_config(&self) -> Config {
        let mut config = Config::new();
        config.host(&self.host);
        config.port(self.port);
        config.database(&self.database);
        config.application_name(&self.application_name);
        config.authentication(AuthMethod::sql_server(
            &self.username,
            self.password.expose_secret(),
        ));

        if self.encrypt {
            config.encryption(EncryptionLevel::Required);
            if self.trust_server_certificate {
                config.trust_cert();
            }
        } else {
            config.encryption(EncryptionLevel::NotSupported);
        }

        config
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_true() -> bool {
    true
}

fn default_application_name() -> String {
    DEFAULT_APPLICATION_NAME.to_string()
}

/// Rejects names that can't be safely spliced into a statement.
///
/// Capture function names embed the capture instance and can't be bound as parameters.
fn validate_identifier(name: &str) -> RelayResult<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_IDENTIFIER_LENGTH
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');

    if !valid {
        bail!(
            ErrorKind::SourceSchemaError,
            "Invalid capture instance name",
            format!("'{name}' is not a plain identifier")
        );
    }

    Ok(())
}

/// Decodes a binary position, treating NULL and the all-zero position as absent.
fn decode_lsn(bytes: Option<&[u8]>) -> RelayResult<Option<Lsn>> {
    match bytes {
        None => Ok(None),
        Some(bytes) if bytes.iter().all(|b| *b == 0) => Ok(None),
        Some(bytes) => Ok(Some(Lsn::from_bytes(bytes)?)),
    }
}

fn required_lsn(row: &Row, index: usize) -> RelayResult<Lsn> {
    decode_lsn(row.try_get::<&[u8], _>(index)?)?.ok_or_else(|| {
        relay_error!(
            ErrorKind::InvalidData,
            "Missing log sequence number",
            format!("column {index} of a change row is NULL")
        )
    })
}

/// Renders a `decimal`/`numeric` value as a string so no precision is lost.
fn numeric_to_json(value: Numeric) -> Value {
    let scale = u32::from(value.scale());
    let digits = value.value().unsigned_abs();
    let sign = if value.value() < 0 { "-" } else { "" };

    if scale == 0 {
        return Value::String(format!("{sign}{digits}"));
    }

    let factor = 10u128.pow(scale);
    Value::String(format!(
        "{sign}{}.{:0width$}",
        digits / factor,
        digits % factor,
        width = scale as usize
    ))
}

/// Converts one column of a row into JSON, trying the common types first.
fn column_to_json(row: &Row, index: usize) -> Value {
    if let Some(v) = row.try_get::<&str, _>(index).ok().flatten() {
        Value::String(v.to_string())
    } else if let Some(v) = row.try_get::<i64, _>(index).ok().flatten() {
        Value::from(v)
    } else if let Some(v) = row.try_get::<i32, _>(index).ok().flatten() {
        Value::from(v)
    } else if let Some(v) = row.try_get::<i16, _>(index).ok().flatten() {
        Value::from(v)
    } else if let Some(v) = row.try_get::<u8, _>(index).ok().flatten() {
        Value::from(v)
    } else if let Some(v) = row.try_get::<f64, _>(index).ok().flatten() {
        serde_json::Number::from_f64(v)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    } else if let Some(v) = row.try_get::<f32, _>(index).ok().flatten() {
        serde_json::Number::from_f64(f64::from(v))
            .map(Value::Number)
            .unwrap_or(Value::Null)
    } else if let Some(v) = row.try_get::<Numeric, _>(index).ok().flatten() {
        numeric_to_json(v)
    } else if let Some(v) = row.try_get::<bool, _>(index).ok().flatten() {
        Value::Bool(v)
    } else if let Some(v) = row.try_get::<&[u8], _>(index).ok().flatten() {
        Value::String(STANDARD.encode(v))
    } else if let Some(v) = row.try_get::<NaiveDateTime, _>(index).ok().flatten() {
        Value::String(v.format("%Y-%m-%dT%H:%M:%S%.f").to_string())
    } else if let Some(v) = row.try_get::<DateTime<Utc>, _>(index).ok().flatten() {
        Value::String(v.to_rfc3339())
    } else if let Some(v) = row.try_get::<NaiveDate, _>(index).ok().flatten() {
        Value::String(v.format("%Y-%m-%d").to_string())
    } else if let Some(v) = row.try_get::<NaiveTime, _>(index).ok().flatten() {
        Value::String(v.format("%H:%M:%S%.f").to_string())
    } else if let Some(v) = row.try_get::<Uuid, _>(index).ok().flatten() {
        Value::String(v.to_string())
    } else {
        Value::Null
    }
}

fn parse_change_row(row: &Row) -> RelayResult<ChangeRow> {
    let lsn = required_lsn(row, 0)?;
    let seqval = required_lsn(row, 1)?;
    let operation = row.try_get::<i32, _>(2)?.ok_or_else(|| {
        relay_error!(ErrorKind::InvalidData, "Change row without operation code")
    })?;
    let commit_time = row
        .try_get::<NaiveDateTime, _>(3)
        .ok()
        .flatten()
        .map(|time| time.and_utc());

    let mut columns = Map::new();
    for (index, column) in row.columns().iter().enumerate() {
        if column.name().starts_with(METADATA_COLUMN_PREFIX) {
            continue;
        }
        columns.insert(column.name().to_string(), column_to_json(row, index));
    }

    Ok(ChangeRow {
        lsn,
        seqval,
        operation,
        commit_time,
        columns,
    })
}

/// [`ChangeLog`] reading SQL Server change data capture tables.
///
/// The connection is opened on first use and dropped after any failed statement, so the next
/// call reconnects.
pub struct SqlServerChangeLog {
    parameters: SqlServerParameters,
    client: Mutex<Option<Client<Compat<TcpStream>>>>,
}

impl SqlServerChangeLog {
    pub fn new(parameters: SqlServerParameters) -> Self {
        Self {
            parameters,
            client: Mutex::new(None),
        }
    }

    async fn connect(&self) -> RelayResult<Client<Compat<TcpStream>>> {
        let config = self.parameters.to_tiberius_config();

        let tcp = TcpStream::connect(config.get_addr()).await.map_err(|err| {
            relay_error!(
                ErrorKind::SourceConnectionFailed,
                "SQL Server connection failed",
                format!("{}:{}", self.parameters.host, self.parameters.port),
                source: err
            )
        })?;
        tcp.set_nodelay(true)?;

        let client = Client::connect(config, tcp.compat_write()).await?;

        info!(
            host = %self.parameters.host,
            port = self.parameters.port,
            database = %self.parameters.database,
            "connected to sql server"
        );

        Ok(client)
    }

    async fn query(&self, sql: &str, params: &[&dyn ToSql]) -> RelayResult<Vec<Row>> {
        let mut guard = self.client.lock().await;
        if guard.is_none() {
            *guard = Some(self.connect().await?);
        }
        let Some(client) = guard.as_mut() else {
            bail!(ErrorKind::InvalidState, "SQL Server client is not connected");
        };

        let result = match client.query(sql, params).await {
            Ok(stream) => stream.into_first_result().await,
            Err(err) => Err(err),
        };

        if let Err(err) = &result {
            warn!(error = %err, "sql server statement failed, dropping connection");
            *guard = None;
        }

        Ok(result?)
    }

    async fn execute(&self, sql: &str, params: &[&dyn ToSql]) -> RelayResult<()> {
        let mut guard = self.client.lock().await;
        if guard.is_none() {
            *guard = Some(self.connect().await?);
        }
        let Some(client) = guard.as_mut() else {
            bail!(ErrorKind::InvalidState, "SQL Server client is not connected");
        };

        let result = client.execute(sql, params).await;

        if let Err(err) = &result {
            warn!(error = %err, "sql server statement failed, dropping connection");
            *guard = None;
        }

        result?;

        Ok(())
    }

    async fn query_lsn(&self, sql: &str, params: &[&dyn ToSql]) -> RelayResult<Option<Lsn>> {
        let rows = self.query(sql, params).await?;

        match rows.first() {
            Some(row) => decode_lsn(row.try_get::<&[u8], _>(0)?),
            None => Ok(None),
        }
    }
}

impl fmt::Debug for SqlServerChangeLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqlServerChangeLog")
            .field("host", &self.parameters.host)
            .field("port", &self.parameters.port)
            .field("database", &self.parameters.database)
            .finish_non_exhaustive()
    }
}

impl ChangeLog for SqlServerChangeLog {
    async fn max_lsn(&self) -> RelayResult<Option<Lsn>> {
        self.query_lsn("SELECT sys.fn_cdc_get_max_lsn()", &[]).await
    }

    async fn min_lsn(&self, capture_instance: &str) -> RelayResult<Option<Lsn>> {
        self.query_lsn("SELECT sys.fn_cdc_get_min_lsn(@P1)", &[&capture_instance])
            .await
    }

    async fn lsn_at_or_before(&self, time: DateTime<Utc>) -> RelayResult<Option<Lsn>> {
        let time = time.naive_utc();

        self.query_lsn(
            "SELECT sys.fn_cdc_map_time_to_lsn('largest less than or equal', @P1)",
            &[&time],
        )
        .await
    }

    async fn changed_rows(
        &self,
        capture_instance: &str,
        from: &Lsn,
        to: &Lsn,
    ) -> RelayResult<Vec<ChangeRow>> {
        validate_identifier(capture_instance)?;

        let from: [u8; LSN_SIZE] = from.to_bytes()?;
        let to: [u8; LSN_SIZE] = to.to_bytes()?;
        let sql = format!(
            r#"
            SELECT __$start_lsn, __$seqval, __$operation,
                   sys.fn_cdc_map_lsn_to_time(__$start_lsn) AS __$commit_time,
                   *
            FROM cdc.fn_cdc_get_all_changes_{capture_instance}(@P1, @P2, N'all update old')
            ORDER BY __$start_lsn, __$seqval, __$operation
            "#
        );

        let rows = self
            .query(&sql, &[&from.as_slice(), &to.as_slice()])
            .await?;
        debug!(capture_instance, rows = rows.len(), "read change rows");

        rows.iter().map(parse_change_row).collect()
    }

    async fn is_database_enabled(&self) -> RelayResult<bool> {
        let rows = self
            .query(
                "SELECT is_cdc_enabled FROM sys.databases WHERE name = DB_NAME()",
                &[],
            )
            .await?;

        Ok(rows
            .first()
            .and_then(|row| row.try_get::<bool, _>(0).ok().flatten())
            .unwrap_or(false))
    }

    async fn capture_instance(&self, schema: &str, table: &str) -> RelayResult<Option<String>> {
        let rows = self
            .query(
                r#"
                SELECT TOP (1) ct.capture_instance
                FROM cdc.change_tables ct
                JOIN sys.tables t ON ct.source_object_id = t.object_id
                JOIN sys.schemas s ON t.schema_id = s.schema_id
                WHERE s.name = @P1 AND t.name = @P2 AND t.is_tracked_by_cdc = 1
                ORDER BY ct.create_date DESC
                "#,
                &[&schema, &table],
            )
            .await?;

        Ok(rows
            .first()
            .and_then(|row| row.try_get::<&str, _>(0).ok().flatten())
            .map(str::to_string))
    }

    async fn captured_columns(&self, capture_instance: &str) -> RelayResult<Vec<String>> {
        let rows = self
            .query(
                r#"
                SELECT cc.column_name
                FROM cdc.captured_columns cc
                JOIN cdc.change_tables ct ON cc.object_id = ct.object_id
                WHERE ct.capture_instance = @P1
                ORDER BY cc.column_ordinal
                "#,
                &[&capture_instance],
            )
            .await?;

        Ok(rows
            .iter()
            .filter_map(|row| row.try_get::<&str, _>(0).ok().flatten())
            .map(str::to_string)
            .collect())
    }

    async fn enable_database(&self) -> RelayResult<()> {
        self.execute("EXEC sys.sp_cdc_enable_db", &[]).await
    }

    async fn enable_table(
        &self,
        schema: &str,
        table: &str,
        captured_columns: &[String],
    ) -> RelayResult<()> {
        if captured_columns.is_empty() {
            return self
                .execute(
                    "EXEC sys.sp_cdc_enable_table @source_schema = @P1, @source_name = @P2, @role_name = NULL",
                    &[&schema, &table],
                )
                .await;
        }

        let column_list = captured_columns.join(",");
        self.execute(
            "EXEC sys.sp_cdc_enable_table @source_schema = @P1, @source_name = @P2, @role_name = NULL, @captured_column_list = @P3",
            &[&schema, &table, &column_list.as_str()],
        )
        .await
    }
}

/// Serves the `SqlServer` connection type.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlServerSourceFactory;

impl SqlServerSourceFactory {
    pub const NAME: &'static str = "SqlServer";
}

impl SourceFactory for SqlServerSourceFactory {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn create(&self, connection: &ConnectionConfig) -> RelayResult<Arc<dyn ChangeSource>> {
        let parameters: SqlServerParameters = serde_json::from_value(
            connection.parameters.clone(),
        )
        .map_err(|err| {
            relay_error!(
                ErrorKind::ConfigError,
                "Invalid SqlServer connection parameters",
                format!("connection '{}'", connection.name),
                source: err
            )
        })?;

        Ok(Arc::new(LogChangeSource::new(SqlServerChangeLog::new(
            parameters,
        ))))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn connection(parameters: Value) -> ConnectionConfig {
        serde_json::from_value(json!({
            "name": "erp",
            "type": "SqlServer",
            "parameters": parameters
        }))
        .unwrap()
    }

    #[test]
    fn parameters_apply_defaults() {
        let parameters: SqlServerParameters = serde_json::from_value(json!({
            "host": "db.internal",
            "database": "erp",
            "username": "relay",
            "password": "secret"
        }))
        .unwrap();

        assert_eq!(parameters.port, 1433);
        assert!(parameters.encrypt);
        assert!(!parameters.trust_server_certificate);
        assert_eq!(parameters.application_name, "relay");
        assert!(!format!("{parameters:?}").contains("secret"));
    }

    #[test]
    fn factory_rejects_incomplete_parameters() {
        let err = SqlServerSourceFactory
            .create(&connection(json!({"host": "db.internal"})))
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ConfigError);
    }

    #[test]
    fn factory_builds_a_lazy_source() {
        let source = SqlServerSourceFactory
            .create(&connection(json!({
                "host": "db.internal",
                "database": "erp",
                "username": "relay",
                "password": "secret"
            })))
            .unwrap();

        assert!(format!("{source:?}").contains("db.internal"));
    }

    #[test]
    fn identifiers_must_be_plain() {
        assert!(validate_identifier("dbo_Orders").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("dbo_Orders(0x0); DROP TABLE x;--").is_err());
        assert!(validate_identifier(&"a".repeat(129)).is_err());
    }

    #[test]
    fn numerics_keep_their_scale() {
        assert_eq!(numeric_to_json(Numeric::new_with_scale(1999, 2)), json!("19.99"));
        assert_eq!(numeric_to_json(Numeric::new_with_scale(-150, 2)), json!("-1.50"));
        assert_eq!(numeric_to_json(Numeric::new_with_scale(-5, 3)), json!("-0.005"));
        assert_eq!(numeric_to_json(Numeric::new_with_scale(42, 0)), json!("42"));
        assert_eq!(
            numeric_to_json(Numeric::new_with_scale(12345678901234567890123456789, 10)),
            json!("1234567890123456789.0123456789")
        );
    }

    #[test]
    fn zero_and_null_positions_are_absent() {
        assert_eq!(decode_lsn(None).unwrap(), None);
        assert_eq!(decode_lsn(Some(&[0u8; LSN_SIZE])).unwrap(), None);

        let lsn = decode_lsn(Some(&[0, 0, 0, 0, 0, 0, 0, 0, 0, 7])).unwrap();
        assert_eq!(lsn, Some(Lsn::from(7)));

        assert!(decode_lsn(Some(&[1, 2])).is_err());
    }
}
