//! Relational database source
//!
//! Regions are read from one table with a range-overlap query built from the
//! source's [`FieldSpec`]s. Connections are opened per load and dropped on every
//! exit path.

use super::{DataSource, LoadContext, SegmentLoader, SourceError};
use crate::models::field::{
    MapDirection, PROPERTY_CHROMOSOME, PROPERTY_END, PROPERTY_ORIENTATION, PROPERTY_SCORE,
    PROPERTY_START, PROPERTY_STRAND, PROPERTY_TYPE,
};
use crate::models::{
    DataSegment, DataType, FieldSpec, FieldValue, Orientation, Region, SegmentData,
};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

pub const PROTOCOL: &str = "SQL";
pub const SUPPORTED: &[DataType] = &[DataType::Region];

/// Database client used by a SQL source
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SqlDriver {
    /// Embedded DuckDB database file; `database` is its path
    #[default]
    DuckDb,
    /// PostgreSQL server
    Postgres,
}

impl SqlDriver {
    pub fn as_str(&self) -> &'static str {
        match self {
            SqlDriver::DuckDb => "duckdb",
            SqlDriver::Postgres => "postgres",
        }
    }

    fn placeholders(&self) -> [&'static str; 3] {
        match self {
            SqlDriver::DuckDb => ["?", "?", "?"],
            SqlDriver::Postgres => ["$1", "$2::bigint", "$3::bigint"],
        }
    }
}

impl fmt::Display for SqlDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SqlDriver {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "duckdb" => Ok(SqlDriver::DuckDb),
            "postgres" | "postgresql" => Ok(SqlDriver::Postgres),
            _ => Err(format!(
                "Unsupported SQL driver: {}. Expected: duckdb, postgres",
                s
            )),
        }
    }
}

/// Quote an identifier, keeping schema qualification (`schema.table`)
fn quote_identifier(name: &str) -> String {
    name.split('.')
        .map(|part| format!("\"{}\"", part.trim().replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(".")
}

/// Region table in a relational database
#[derive(Clone, Default)]
pub struct SqlSource {
    pub driver: SqlDriver,
    pub server: String,
    pub port: Option<u16>,
    pub database: String,
    pub username: String,
    /// Plain text in memory; encrypted when persisted
    pub password: String,
    table: String,
    fields: Vec<FieldSpec>,
    query: OnceLock<String>,
}

impl SqlSource {
    pub fn new(driver: SqlDriver, database: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            driver,
            database: database.into(),
            table: table.into(),
            ..Default::default()
        }
    }

    pub fn with_server(mut self, server: impl Into<String>, port: Option<u16>) -> Self {
        self.server = server.into();
        self.port = port;
        self
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    pub fn with_field(mut self, field: FieldSpec) -> Self {
        self.fields.push(field);
        self.query = OnceLock::new();
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn set_table(&mut self, table: impl Into<String>) {
        self.table = table.into();
        self.query = OnceLock::new();
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn set_fields(&mut self, fields: Vec<FieldSpec>) {
        self.fields = fields;
        self.query = OnceLock::new();
    }

    pub fn field(&self, property: &str) -> Option<&FieldSpec> {
        self.fields
            .iter()
            .find(|f| f.property_name().eq_ignore_ascii_case(property))
    }

    fn source_column(&self, property: &str) -> Result<&str, SourceError> {
        self.field(property)
            .and_then(|f| f.source_field())
            .ok_or_else(|| {
                SourceError::Configuration(format!(
                    "SQL source for table '{}' needs a database field for '{}'",
                    self.table, property
                ))
            })
    }

    /// Check that the source can build its query
    pub fn validate(&self) -> Result<(), SourceError> {
        if self.table.trim().is_empty() {
            return Err(SourceError::Configuration(
                "SQL source has no table".to_string(),
            ));
        }
        if self.database.trim().is_empty() {
            return Err(SourceError::Configuration(format!(
                "SQL source for table '{}' has no database",
                self.table
            )));
        }
        for property in [PROPERTY_CHROMOSOME, PROPERTY_START, PROPERTY_END] {
            self.source_column(property)?;
        }
        if self.field(PROPERTY_TYPE).is_none() {
            return Err(SourceError::Configuration(format!(
                "SQL source for table '{}' needs a field or value for 'type'",
                self.table
            )));
        }
        Ok(())
    }

    /// Distinct source columns, in field order
    pub fn columns(&self) -> Vec<&str> {
        let mut columns: Vec<&str> = Vec::new();
        for field in &self.fields {
            if let Some(column) = field.source_field()
                && !columns.contains(&column)
            {
                columns.push(column);
            }
        }
        columns
    }

    fn build_query(&self) -> Result<String, SourceError> {
        self.validate()?;
        let chromosome = quote_identifier(self.source_column(PROPERTY_CHROMOSOME)?);
        let start = quote_identifier(self.source_column(PROPERTY_START)?);
        let end = quote_identifier(self.source_column(PROPERTY_END)?);
        // Native values first, then the same columns as text for types outside
        // text/integer/real/boolean
        let quoted = self
            .columns()
            .into_iter()
            .map(quote_identifier)
            .collect::<Vec<_>>();
        let columns = quoted
            .iter()
            .cloned()
            .chain(quoted.iter().map(|c| format!("CAST({} AS VARCHAR)", c)))
            .collect::<Vec<_>>()
            .join(", ");
        let [p_chromosome, p_start, p_end] = self.driver.placeholders();
        Ok(format!(
            "SELECT {} FROM {} WHERE {} = {} AND NOT ({} < {} OR {} > {})",
            columns,
            quote_identifier(&self.table),
            chromosome,
            p_chromosome,
            end,
            p_start,
            start,
            p_end
        ))
    }

    /// Range-overlap query, built once per source
    pub fn query(&self) -> Result<&str, SourceError> {
        if let Some(query) = self.query.get() {
            return Ok(query);
        }
        let query = self.build_query()?;
        Ok(self.query.get_or_init(|| query))
    }

    /// Chromosome name as stored in the database
    fn outbound_chromosome(&self, chromosome: &str) -> Result<String, SourceError> {
        match self.field(PROPERTY_CHROMOSOME) {
            Some(spec) => Ok(spec
                .transformed_value(&FieldValue::Text(chromosome.to_string()), MapDirection::ToSource)?
                .to_string()),
            None => Ok(chromosome.to_string()),
        }
    }

    /// Build a region from one row (`values` aligned with [`SqlSource::columns`])
    fn region_from_row(
        &self,
        columns: &[&str],
        values: &[FieldValue],
        segment: &DataSegment,
    ) -> Result<Region, SourceError> {
        let mut start = None;
        let mut end = None;
        let mut region_type = None;
        let mut score = 0.0;
        let mut orientation = Orientation::Indeterminate;
        let mut extra = Vec::new();

        for spec in &self.fields {
            let property = spec.property_name().to_lowercase();
            if property == PROPERTY_CHROMOSOME {
                continue;
            }
            let raw = spec
                .source_field()
                .and_then(|column| columns.iter().position(|c| *c == column))
                .and_then(|index| values.get(index));
            let value = spec.resolve(raw)?;
            match property.as_str() {
                PROPERTY_START => start = value.as_i64(),
                PROPERTY_END => end = value.as_i64(),
                PROPERTY_TYPE if !value.is_null() => region_type = Some(value.to_string()),
                PROPERTY_SCORE => score = value.as_f64().unwrap_or(0.0),
                PROPERTY_STRAND | PROPERTY_ORIENTATION => {
                    orientation = Orientation::from_token(&value.to_string())
                }
                _ if !value.is_null() => extra.push((spec.property_name().to_string(), value)),
                _ => {}
            }
        }

        let (Some(start), Some(end)) = (start, end) else {
            return Err(SourceError::DataContract(format!(
                "Row of table '{}' has no start/end",
                self.table
            )));
        };
        let region_type = region_type.ok_or_else(|| {
            SourceError::DataContract(format!("Row of table '{}' has no type", self.table))
        })?;

        let mut region = Region::new(start - segment.start, end - segment.start, region_type)
            .with_score(score)
            .with_orientation(orientation);
        for (name, value) in extra {
            region.set_property(name, value);
        }
        Ok(region)
    }

    #[cfg(feature = "duckdb-backend")]
    fn fetch_duckdb(
        &self,
        query: &str,
        chromosome: &str,
        start: i64,
        end: i64,
    ) -> Result<Vec<Vec<FieldValue>>, SourceError> {
        use duckdb::{AccessMode, Config};

        let config = Config::default().access_mode(AccessMode::ReadOnly)?;
        let conn = duckdb::Connection::open_with_flags(&self.database, config)?;
        let mut stmt = conn.prepare(query)?;
        let column_count = self.columns().len();
        let mut rows = stmt.query(duckdb::params![chromosome, start, end])?;

        let mut result = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(column_count);
            for i in 0..column_count {
                let value: duckdb::types::Value = row.get(i)?;
                let value = match duckdb_value(value) {
                    Some(value) => value,
                    None => match row.get::<_, Option<String>>(column_count + i)? {
                        Some(text) => FieldValue::Text(text),
                        None => FieldValue::Null,
                    },
                };
                values.push(value);
            }
            result.push(values);
        }
        Ok(result)
    }

    #[cfg(not(feature = "duckdb-backend"))]
    fn fetch_duckdb(
        &self,
        _query: &str,
        _chromosome: &str,
        _start: i64,
        _end: i64,
    ) -> Result<Vec<Vec<FieldValue>>, SourceError> {
        Err(SourceError::Configuration(
            "The duckdb driver requires the 'duckdb-backend' feature".to_string(),
        ))
    }

    #[cfg(feature = "postgres-backend")]
    fn fetch_postgres(
        &self,
        query: &str,
        chromosome: &str,
        start: i64,
        end: i64,
        ctx: &LoadContext<'_>,
    ) -> Result<Vec<Vec<FieldValue>>, SourceError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let mut config = tokio_postgres::Config::new();
        config
            .host(&self.server)
            .dbname(&self.database)
            .user(&self.username)
            .password(&self.password)
            .connect_timeout(ctx.settings.timeout());
        if let Some(port) = self.port {
            config.port(port);
        }

        runtime.block_on(async {
            let (client, connection) = config
                .connect(tokio_postgres::NoTls)
                .await
                .map_err(|e| SourceError::Database(e.to_string()))?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    tracing::warn!("PostgreSQL connection error: {}", e);
                }
            });

            let rows = client
                .query(query, &[&chromosome, &start, &end])
                .await
                .map_err(|e| SourceError::Database(e.to_string()))?;
            let column_count = self.columns().len();
            rows.iter()
                .map(|row| postgres_values(row, column_count))
                .collect()
        })
    }

    #[cfg(not(feature = "postgres-backend"))]
    fn fetch_postgres(
        &self,
        _query: &str,
        _chromosome: &str,
        _start: i64,
        _end: i64,
        _ctx: &LoadContext<'_>,
    ) -> Result<Vec<Vec<FieldValue>>, SourceError> {
        Err(SourceError::Configuration(
            "The postgres driver requires the 'postgres-backend' feature".to_string(),
        ))
    }
}

#[cfg(feature = "duckdb-backend")]
impl From<duckdb::Error> for SourceError {
    fn from(err: duckdb::Error) -> Self {
        SourceError::Database(err.to_string())
    }
}

/// Core-typed value, or `None` when the column must be read as text
#[cfg(feature = "duckdb-backend")]
fn duckdb_value(value: duckdb::types::Value) -> Option<FieldValue> {
    use duckdb::types::Value;

    let value = match value {
        Value::Null => FieldValue::Null,
        Value::Boolean(b) => FieldValue::Boolean(b),
        Value::TinyInt(n) => FieldValue::Integer(n.into()),
        Value::SmallInt(n) => FieldValue::Integer(n.into()),
        Value::Int(n) => FieldValue::Integer(n.into()),
        Value::BigInt(n) => FieldValue::Integer(n),
        Value::UTinyInt(n) => FieldValue::Integer(n.into()),
        Value::USmallInt(n) => FieldValue::Integer(n.into()),
        Value::UInt(n) => FieldValue::Integer(n.into()),
        Value::UBigInt(n) => match i64::try_from(n) {
            Ok(n) => FieldValue::Integer(n),
            Err(_) => FieldValue::Real(n as f64),
        },
        Value::HugeInt(n) => match i64::try_from(n) {
            Ok(n) => FieldValue::Integer(n),
            Err(_) => FieldValue::Real(n as f64),
        },
        Value::Float(f) => FieldValue::Real(f.into()),
        Value::Double(f) => FieldValue::Real(f),
        Value::Decimal(d) => d
            .to_string()
            .parse::<f64>()
            .map(FieldValue::Real)
            .unwrap_or_else(|_| FieldValue::Text(d.to_string())),
        Value::Text(s) => FieldValue::Text(s),
        _ => return None,
    };
    Some(value)
}

#[cfg(feature = "postgres-backend")]
fn postgres_values(
    row: &tokio_postgres::Row,
    column_count: usize,
) -> Result<Vec<FieldValue>, SourceError> {
    use tokio_postgres::types::Type;

    let db_err = |e: tokio_postgres::Error| SourceError::Database(e.to_string());
    let mut values = Vec::with_capacity(column_count);
    for (i, column) in row.columns().iter().take(column_count).enumerate() {
        let ty = column.type_();
        let value = if *ty == Type::BOOL {
            row.try_get::<_, Option<bool>>(i)
                .map_err(db_err)?
                .map(FieldValue::Boolean)
        } else if *ty == Type::INT2 {
            row.try_get::<_, Option<i16>>(i)
                .map_err(db_err)?
                .map(|n| FieldValue::Integer(n.into()))
        } else if *ty == Type::INT4 {
            row.try_get::<_, Option<i32>>(i)
                .map_err(db_err)?
                .map(|n| FieldValue::Integer(n.into()))
        } else if *ty == Type::INT8 {
            row.try_get::<_, Option<i64>>(i)
                .map_err(db_err)?
                .map(FieldValue::Integer)
        } else if *ty == Type::FLOAT4 {
            row.try_get::<_, Option<f32>>(i)
                .map_err(db_err)?
                .map(|f| FieldValue::Real(f.into()))
        } else if *ty == Type::FLOAT8 {
            row.try_get::<_, Option<f64>>(i)
                .map_err(db_err)?
                .map(FieldValue::Real)
        } else {
            row.try_get::<_, Option<String>>(column_count + i)
                .map_err(db_err)?
                .map(FieldValue::Text)
        };
        values.push(value.unwrap_or(FieldValue::Null));
    }
    Ok(values)
}

impl PartialEq for SqlSource {
    fn eq(&self, other: &Self) -> bool {
        self.driver == other.driver
            && self.server == other.server
            && self.port == other.port
            && self.database == other.database
            && self.username == other.username
            && self.password == other.password
            && self.table == other.table
            && self.fields == other.fields
    }
}

impl fmt::Debug for SqlSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqlSource")
            .field("driver", &self.driver)
            .field("server", &self.server)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("table", &self.table)
            .field("username", &self.username)
            .field("password", &"***")
            .field("fields", &self.fields)
            .finish()
    }
}

impl SegmentLoader for SqlSource {
    fn protocol(&self) -> &'static str {
        PROTOCOL
    }

    fn supported_data(&self) -> &'static [DataType] {
        SUPPORTED
    }

    fn use_cache(&self) -> bool {
        true
    }

    fn server_address(&self) -> Option<String> {
        if self.server.is_empty() {
            return None;
        }
        Some(match self.port {
            Some(port) => format!("{}:{}", self.server, port),
            None => self.server.clone(),
        })
    }

    fn set_server_address(&mut self, address: &str) -> Result<(), SourceError> {
        let address = address.trim();
        match address.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => {
                let port = port.parse::<u16>().map_err(|_| {
                    SourceError::Configuration(format!("Invalid port in server address '{}'", address))
                })?;
                self.server = host.to_string();
                self.port = Some(port);
            }
            _ => {
                self.server = address.to_string();
                self.port = None;
            }
        }
        Ok(())
    }

    fn load(
        &self,
        source: &DataSource,
        segment: &mut DataSegment,
        ctx: &LoadContext<'_>,
    ) -> Result<(), SourceError> {
        let query = self.query()?;
        let chromosome = self.outbound_chromosome(&segment.chromosome)?;
        if let Some(server) = self.server_address() {
            ctx.throttle(&server, source.delay_ms);
        }
        tracing::debug!(
            "{} query on {}: {} [{}, {}, {}]",
            self.driver,
            self.database,
            query,
            chromosome,
            segment.start,
            segment.end
        );

        let rows = match self.driver {
            SqlDriver::DuckDb => self.fetch_duckdb(query, &chromosome, segment.start, segment.end)?,
            SqlDriver::Postgres => {
                self.fetch_postgres(query, &chromosome, segment.start, segment.end, ctx)?
            }
        };

        let columns = self.columns();
        let regions = rows
            .iter()
            .map(|values| self.region_from_row(&columns, values, segment))
            .collect::<Result<Vec<_>, _>>()?;
        tracing::debug!("{} regions from table '{}'", regions.len(), self.table);
        segment
            .set_payload(SegmentData::Regions(regions))
            .map_err(SourceError::DataContract)
    }
}
