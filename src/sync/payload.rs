//! Typed entity payloads
//!
//! Clients send loosely-typed JSON per entity. It is validated here, at the
//! boundary, into one variant per entity type before it reaches the store.
//! Wire field names match the platform's existing (Italian) schema.

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::types::EntityType;
use crate::error::{AppError, Result};

/// Calendar event fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EventPayload {
    #[serde(rename = "titolo")]
    pub title: String,
    #[serde(rename = "descrizione", default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "data_inizio", default, skip_serializing_if = "Option::is_none")]
    pub starts_at: Option<NaiveDateTime>,
    #[serde(rename = "data_fine", default, skip_serializing_if = "Option::is_none")]
    pub ends_at: Option<NaiveDateTime>,
    #[serde(rename = "luogo", default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(rename = "tipo", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Bassa,
    #[default]
    Media,
    Alta,
    Urgente,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    DaFare,
    InCorso,
    Completato,
    Annullato,
}

/// Task fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskPayload {
    #[serde(rename = "titolo")]
    pub title: String,
    #[serde(rename = "descrizione", default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "priorita", default)]
    pub priority: TaskPriority,
    #[serde(rename = "stato", default)]
    pub status: TaskStatus,
    #[serde(rename = "data_scadenza", default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<NaiveDate>,
    #[serde(rename = "assegnato_a", default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    #[default]
    Bozza,
    InRevisione,
    Approvato,
    Archiviato,
}

/// Document metadata fields (file content lives elsewhere)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DocumentPayload {
    #[serde(rename = "titolo")]
    pub title: String,
    #[serde(rename = "contenuto", default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(rename = "cartella_id", default, skip_serializing_if = "Option::is_none")]
    pub folder_id: Option<i64>,
    #[serde(rename = "stato", default)]
    pub status: DocumentStatus,
    #[serde(rename = "codice", default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// Payload of a sync entity, one variant per entity type
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EntityPayload {
    Event(EventPayload),
    Task(TaskPayload),
    Document(DocumentPayload),
}

impl EntityPayload {
    /// Validate client JSON as the payload of `entity_type`
    pub fn parse(entity_type: EntityType, data: &Value) -> Result<Self> {
        if !data.is_object() {
            return Err(AppError::validation(format!(
                "{} data must be a JSON object",
                entity_type
            )));
        }

        let payload = Self::decode(entity_type, data.clone()).map_err(|e| {
            AppError::validation(format!("Invalid {} data: {}", entity_type, e))
        })?;
        payload.validate()?;
        Ok(payload)
    }

    /// Decode a payload previously written by the store
    pub(crate) fn from_stored(entity_type: EntityType, raw: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(raw)?;
        Ok(Self::decode(entity_type, value)?)
    }

    fn decode(entity_type: EntityType, value: Value) -> serde_json::Result<Self> {
        Ok(match entity_type {
            EntityType::Event => EntityPayload::Event(serde_json::from_value(value)?),
            EntityType::Task => EntityPayload::Task(serde_json::from_value(value)?),
            EntityType::Document => EntityPayload::Document(serde_json::from_value(value)?),
        })
    }

    fn validate(&self) -> Result<()> {
        if self.title().trim().is_empty() {
            return Err(AppError::validation(format!(
                "{} titolo must not be empty",
                self.entity_type()
            )));
        }

        if let EntityPayload::Event(event) = self {
            if let (Some(start), Some(end)) = (event.starts_at, event.ends_at) {
                if end < start {
                    return Err(AppError::validation(
                        "event data_fine is before data_inizio",
                    ));
                }
            }
        }

        Ok(())
    }

    pub fn entity_type(&self) -> EntityType {
        match self {
            EntityPayload::Event(_) => EntityType::Event,
            EntityPayload::Task(_) => EntityType::Task,
            EntityPayload::Document(_) => EntityType::Document,
        }
    }

    pub fn title(&self) -> &str {
        match self {
            EntityPayload::Event(event) => &event.title,
            EntityPayload::Task(task) => &task.title,
            EntityPayload::Document(document) => &document.title,
        }
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}
