//! Fixtures shared by the core integration tests.

#![allow(dead_code)]

use sqlx::PgPool;
use uuid::Uuid;

use printrun_core::run::service::{NewRunRequest, create_run};
use printrun_core::run::snapshot::RunSnapshot;
use printrun_db::queries::items::NewItem;
use printrun_db::queries::materials::NewMaterial;

pub fn item(quantity: i32, model_weight_grams: Option<f64>) -> NewItem {
    NewItem {
        model_id: Uuid::new_v4(),
        model_name: Some("Cable clip".to_string()),
        quantity,
        bed_position: None,
        model_weight_grams,
        estimated_cost_per_unit: None,
    }
}

pub fn material(spool_id: Uuid, estimated_grams: f64) -> NewMaterial {
    NewMaterial {
        spool_id,
        estimated_model_weight_grams: estimated_grams,
        estimated_flushed_grams: None,
        estimated_tower_grams: None,
    }
}

/// Create an in-progress run with the given items and materials.
pub async fn start_run(pool: &PgPool, items: Vec<NewItem>, materials: Vec<NewMaterial>) -> RunSnapshot {
    create_run(
        pool,
        NewRunRequest {
            estimated_print_time_hours: 2.0,
            printer_name: Some("Prusa MK4".to_string()),
            items,
            materials,
            ..Default::default()
        },
    )
    .await
    .expect("create run")
}
