//! Staging-table record types
//!
//! `AccidentRecord` is the unit of work flowing from the normalizer to the
//! loader. Casualty and vehicle lists travel as JSON documents and land in
//! JSONB columns as atomic values.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Columns of the staging table, in DDL and COPY order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StagingColumn {
    AccidentId,
    Lat,
    Lon,
    Location,
    AccidentDate,
    Severity,
    Borough,
    Casualties,
    Vehicles,
}

impl StagingColumn {
    pub const ALL: [StagingColumn; 9] = [
        StagingColumn::AccidentId,
        StagingColumn::Lat,
        StagingColumn::Lon,
        StagingColumn::Location,
        StagingColumn::AccidentDate,
        StagingColumn::Severity,
        StagingColumn::Borough,
        StagingColumn::Casualties,
        StagingColumn::Vehicles,
    ];

    pub fn name(self) -> &'static str {
        match self {
            StagingColumn::AccidentId => "accident_id",
            StagingColumn::Lat => "lat",
            StagingColumn::Lon => "lon",
            StagingColumn::Location => "location",
            StagingColumn::AccidentDate => "accident_date",
            StagingColumn::Severity => "severity",
            StagingColumn::Borough => "borough",
            StagingColumn::Casualties => "casualties",
            StagingColumn::Vehicles => "vehicles",
        }
    }

    /// Type used in `CREATE TABLE`
    pub fn sql_type(self) -> &'static str {
        match self {
            StagingColumn::AccidentId => "INTEGER PRIMARY KEY",
            StagingColumn::Lat | StagingColumn::Lon => "DOUBLE PRECISION",
            StagingColumn::AccidentDate => "TIMESTAMP",
            StagingColumn::Casualties | StagingColumn::Vehicles => "JSONB",
            StagingColumn::Location | StagingColumn::Severity | StagingColumn::Borough => "TEXT",
        }
    }

    /// `information_schema.columns.data_type` reported for the column
    pub fn catalog_type(self) -> &'static str {
        match self {
            StagingColumn::AccidentId => "integer",
            StagingColumn::Lat | StagingColumn::Lon => "double precision",
            StagingColumn::AccidentDate => "timestamp without time zone",
            StagingColumn::Casualties | StagingColumn::Vehicles => "jsonb",
            StagingColumn::Location | StagingColumn::Severity | StagingColumn::Borough => "text",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Column names of the staging table in COPY order
pub const STAGING_COLUMNS: [&str; 9] = [
    "accident_id",
    "lat",
    "lon",
    "location",
    "accident_date",
    "severity",
    "borough",
    "casualties",
    "vehicles",
];

/// One row of `stg_tfl_accidents`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccidentRecord {
    pub accident_id: i32,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub location: Option<String>,
    pub accident_date: Option<NaiveDateTime>,
    pub severity: Option<String>,
    pub borough: Option<String>,
    pub casualties: Option<Value>,
    pub vehicles: Option<Value>,
}

impl AccidentRecord {
    /// A record with only its key set; every other column is NULL.
    pub fn new(accident_id: i32) -> Self {
        Self {
            accident_id,
            lat: None,
            lon: None,
            location: None,
            accident_date: None,
            severity: None,
            borough: None,
            casualties: None,
            vehicles: None,
        }
    }
}

/// Fixed-size slot map keyed by staging column
#[derive(Debug, Default)]
pub(crate) struct ColumnSlots<'a> {
    slots: [Option<&'a Value>; 9],
}

impl<'a> ColumnSlots<'a> {
    pub(crate) fn set(&mut self, column: StagingColumn, value: &'a Value) {
        self.slots[column.index()] = Some(value);
    }

    pub(crate) fn get(&self, column: StagingColumn) -> Option<&'a Value> {
        self.slots[column.index()]
    }
}
