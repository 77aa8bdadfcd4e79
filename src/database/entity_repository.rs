//! Payment-facing view of the four billable entity tables.
//!
//! The tables belong to their application workflows; this module only reads
//! status and writes payment-outcome columns, always guarded by the value it
//! expects to replace.

use crate::database::error::DatabaseError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::{PgPool, Row};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Kind of thing a payment is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum EntityType {
    Permit,
    BusinessLicense,
    ServiceApplication,
    TaxSubmission,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Permit => "permit",
            EntityType::BusinessLicense => "business_license",
            EntityType::ServiceApplication => "service_application",
            EntityType::TaxSubmission => "tax_submission",
        }
    }

    pub fn table(&self) -> &'static str {
        match self {
            EntityType::Permit => "permit_applications",
            EntityType::BusinessLicense => "business_license_applications",
            EntityType::ServiceApplication => "service_applications",
            EntityType::TaxSubmission => "tax_submissions",
        }
    }

    pub fn status_column(&self) -> &'static str {
        match self {
            EntityType::Permit | EntityType::BusinessLicense => "application_status",
            EntityType::ServiceApplication => "status",
            EntityType::TaxSubmission => "submission_status",
        }
    }

    /// Tax submissions carry a provisional amount due that is overwritten at
    /// payment time; the others store the charged total.
    pub fn amount_column(&self) -> &'static str {
        match self {
            EntityType::TaxSubmission => "total_amount_due_cents",
            _ => "total_amount_cents",
        }
    }

    pub fn records_fee_snapshot(&self) -> bool {
        matches!(
            self,
            EntityType::BusinessLicense | EntityType::ServiceApplication
        )
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "permit" => Ok(EntityType::Permit),
            "business_license" => Ok(EntityType::BusinessLicense),
            "service_application" => Ok(EntityType::ServiceApplication),
            "tax_submission" => Ok(EntityType::TaxSubmission),
            other => Err(format!("unknown entity type '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub entity_type: EntityType,
    pub entity_id: Uuid,
}

/// Payment-outcome columns written onto an entity row.
#[derive(Debug, Clone)]
pub struct EntityPaymentUpdate {
    pub entity: EntityRef,
    pub transaction_id: Uuid,
    pub total_amount_cents: i64,
    pub service_fee_cents: i64,
    pub finix_transfer_id: Option<String>,
    pub finix_payment_instrument_id: String,
    pub fee_snapshot: Option<JsonValue>,
    pub processed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceTileFlags {
    pub requires_review: bool,
    pub has_time_slots: bool,
}

#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Writes the paid outcome unless the entity is already marked paid.
    /// Returns false when nothing changed.
    async fn record_payment(&self, update: &EntityPaymentUpdate) -> Result<bool, DatabaseError>;

    async fn current_status(&self, entity: EntityRef) -> Result<Option<String>, DatabaseError>;

    /// Compare-and-set on the entity's status column.
    async fn advance_status(
        &self,
        entity: EntityRef,
        expected: &str,
        target: &str,
        stamp_issued_at: bool,
    ) -> Result<bool, DatabaseError>;

    async fn service_tile_flags(
        &self,
        application_id: Uuid,
    ) -> Result<Option<ServiceTileFlags>, DatabaseError>;
}

pub struct PgEntityStore {
    pool: PgPool,
}

impl PgEntityStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EntityStore for PgEntityStore {
    async fn record_payment(&self, update: &EntityPaymentUpdate) -> Result<bool, DatabaseError> {
        let entity_type = update.entity.entity_type;
        let timestamp_column = match entity_type {
            EntityType::TaxSubmission => "submitted_at",
            _ => "payment_processed_at",
        };
        let snapshot_assignment = if entity_type.records_fee_snapshot() {
            ", merchant_fee_snapshot = COALESCE($8, merchant_fee_snapshot)"
        } else {
            ""
        };

        let sql = format!(
            "UPDATE {table}
             SET payment_status = 'paid',
                 {amount} = $2,
                 service_fee_cents = $3,
                 payment_transaction_id = $4,
                 finix_transfer_id = $5,
                 finix_payment_instrument_id = $6,
                 {stamp} = $7,
                 updated_at = NOW(){snapshot}
             WHERE id = $1 AND payment_status IS DISTINCT FROM 'paid'",
            table = entity_type.table(),
            amount = entity_type.amount_column(),
            stamp = timestamp_column,
            snapshot = snapshot_assignment,
        );

        let mut query = sqlx::query(&sql)
            .bind(update.entity.entity_id)
            .bind(update.total_amount_cents)
            .bind(update.service_fee_cents)
            .bind(update.transaction_id)
            .bind(&update.finix_transfer_id)
            .bind(&update.finix_payment_instrument_id)
            .bind(update.processed_at);
        if entity_type.records_fee_snapshot() {
            query = query.bind(&update.fee_snapshot);
        }

        let result = query
            .execute(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;

        Ok(result.rows_affected() > 0)
    }

    async fn current_status(&self, entity: EntityRef) -> Result<Option<String>, DatabaseError> {
        let sql = format!(
            "SELECT {status} AS status FROM {table} WHERE id = $1",
            status = entity.entity_type.status_column(),
            table = entity.entity_type.table(),
        );

        let row = sqlx::query(&sql)
            .bind(entity.entity_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;

        match row {
            Some(row) => row
                .try_get::<Option<String>, _>("status")
                .map_err(DatabaseError::from_sqlx),
            None => Ok(None),
        }
    }

    async fn advance_status(
        &self,
        entity: EntityRef,
        expected: &str,
        target: &str,
        stamp_issued_at: bool,
    ) -> Result<bool, DatabaseError> {
        let sql = format!(
            "UPDATE {table}
             SET {status} = $3,
                 issued_at = CASE WHEN $4 THEN NOW() ELSE issued_at END,
                 updated_at = NOW()
             WHERE id = $1 AND {status} = $2",
            table = entity.entity_type.table(),
            status = entity.entity_type.status_column(),
        );

        let result = sqlx::query(&sql)
            .bind(entity.entity_id)
            .bind(expected)
            .bind(target)
            .bind(stamp_issued_at)
            .execute(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;

        Ok(result.rows_affected() > 0)
    }

    async fn service_tile_flags(
        &self,
        application_id: Uuid,
    ) -> Result<Option<ServiceTileFlags>, DatabaseError> {
        let row = sqlx::query(
            "SELECT t.requires_review, t.has_time_slots
             FROM service_applications a
             JOIN municipal_service_tiles t ON t.id = a.tile_id
             WHERE a.id = $1",
        )
        .bind(application_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(ServiceTileFlags {
            requires_review: row
                .try_get("requires_review")
                .map_err(DatabaseError::from_sqlx)?,
            has_time_slots: row
                .try_get("has_time_slots")
                .map_err(DatabaseError::from_sqlx)?,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_type_parses_and_maps_tables() {
        let parsed: EntityType = "business_license".parse().unwrap();
        assert_eq!(parsed, EntityType::BusinessLicense);
        assert_eq!(parsed.table(), "business_license_applications");
        assert!(parsed.records_fee_snapshot());
        assert!("parking_ticket".parse::<EntityType>().is_err());
    }

    #[test]
    fn tax_submission_uses_amount_due_column() {
        assert_eq!(
            EntityType::TaxSubmission.amount_column(),
            "total_amount_due_cents"
        );
        assert_eq!(EntityType::Permit.amount_column(), "total_amount_cents");
        assert!(!EntityType::TaxSubmission.records_fee_snapshot());
    }

    #[test]
    fn entity_type_serializes_snake_case() {
        let json = serde_json::to_value(EntityType::ServiceApplication).unwrap();
        assert_eq!(json, "service_application");
    }
}
