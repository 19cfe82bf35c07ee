use std::sync::Arc;

use serde::{Deserialize, Serialize};
use turso::Database;
use utoipa::ToSchema;

use crate::db::{self, get_string};
use crate::error::ChatError;
use crate::providers::ProviderCatalog;

/// The routing singleton: which provider is tried first and in what order
/// the rest are tried. Read on every chat request, mutated only through
/// the admin control surface.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RoutingSettings {
    pub preferred: String,
    pub fallback_order: Vec<String>,
}

pub struct SettingsStore {
    db: Arc<Database>,
}

impl SettingsStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Read the singleton, creating it with catalog-order defaults on first
    /// access.
    pub async fn get(&self, catalog: &ProviderCatalog) -> Result<RoutingSettings, ChatError> {
        let conn = db::connect(&self.db)?;

        let mut rows = conn
            .query(
                "SELECT preferred, fallback_order FROM routing_settings WHERE id = 1",
                (),
            )
            .await
            .map_err(|e| ChatError::Database(format!("Failed to read routing settings: {e}")))?;

        if let Some(row) = rows
            .next()
            .await
            .map_err(|e| ChatError::Database(format!("Failed to read settings row: {e}")))?
        {
            let preferred = get_string(&row, 0);
            let fallback_order: Vec<String> =
                serde_json::from_str(&get_string(&row, 1)).unwrap_or_default();
            return Ok(RoutingSettings {
                preferred,
                fallback_order,
            });
        }

        // First access: default to catalog order
        let ids = catalog.all_ids();
        let defaults = RoutingSettings {
            preferred: ids.first().cloned().unwrap_or_default(),
            fallback_order: ids.into_iter().skip(1).collect(),
        };
        self.write(&defaults).await?;
        Ok(defaults)
    }

    /// Apply an administrative update. The preferred id must name a
    /// configured, available provider; unknown fallback ids are silently
    /// dropped.
    pub async fn update(
        &self,
        catalog: &ProviderCatalog,
        preferred: Option<String>,
        fallback_order: Option<Vec<String>>,
    ) -> Result<RoutingSettings, ChatError> {
        let mut settings = self.get(catalog).await?;

        if let Some(preferred) = preferred {
            if !catalog.contains(&preferred) {
                return Err(ChatError::BadRequest(format!(
                    "Unknown provider: {preferred}"
                )));
            }
            if !catalog.is_available(&preferred) {
                return Err(ChatError::BadRequest(format!(
                    "Provider {preferred} has no credential configured"
                )));
            }
            settings.preferred = preferred;
        }

        if let Some(order) = fallback_order {
            settings.fallback_order = order
                .into_iter()
                .filter(|id| catalog.contains(id))
                .collect();
        }

        self.write(&settings).await?;
        Ok(settings)
    }

    async fn write(&self, settings: &RoutingSettings) -> Result<(), ChatError> {
        let conn = db::connect(&self.db)?;
        let order = serde_json::to_string(&settings.fallback_order)
            .map_err(|e| ChatError::Internal(format!("Failed to encode fallback order: {e}")))?;

        conn.execute(
            "INSERT INTO routing_settings (id, preferred, fallback_order) VALUES (1, ?, ?) \
             ON CONFLICT (id) DO UPDATE SET \
             preferred = excluded.preferred, fallback_order = excluded.fallback_order",
            (settings.preferred.as_str(), order),
        )
        .await
        .map_err(|e| ChatError::Database(format!("Failed to write routing settings: {e}")))?;
        Ok(())
    }
}
