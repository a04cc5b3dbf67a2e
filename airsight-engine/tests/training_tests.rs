//! Training floor and model retention

mod helpers;

use airsight_common::events::{EventBus, PipelineEvent};
use airsight_engine::db::canonical;
use airsight_engine::trainer::TrainingOutcome;
use airsight_engine::types::Pollutant;
use airsight_engine::Pipeline;
use helpers::*;

#[tokio::test]
async fn test_training_skipped_below_floor_and_runs_at_floor() {
    let pool = memory_pool().await;
    let pipeline = pipeline_with(pool.clone(), fast_config(), vec![]);
    let mut events = pipeline.events().subscribe();

    canonical::upsert_records(&pool, &canonical_series(LAT, LON, 0..999))
        .await
        .unwrap();

    let status = pipeline.run_retrain(Some(Pollutant::Pm25)).await;
    assert!(status.ok);
    assert_eq!(
        status.outcomes[&Pollutant::Pm25],
        TrainingOutcome::Skipped {
            available: 999,
            required: 1000
        }
    );
    assert!(pipeline.registry().get(Pollutant::Pm25).await.is_none());

    let mut saw_skip = false;
    while let Ok(event) = events.try_recv() {
        if let PipelineEvent::TrainingSkipped { available_rows, .. } = event {
            assert_eq!(available_rows, 999);
            saw_skip = true;
        }
    }
    assert!(saw_skip);

    canonical::upsert_records(&pool, &canonical_series(LAT, LON, 999..1000))
        .await
        .unwrap();

    let status = pipeline.run_retrain(Some(Pollutant::Pm25)).await;
    assert!(status.ok, "{:?}", status.detail);
    match &status.outcomes[&Pollutant::Pm25] {
        TrainingOutcome::Trained { version, rows, metrics } => {
            assert_eq!(*version, 1);
            assert_eq!(*rows, 1000);
            assert!(metrics.is_finite());
            assert_eq!(metrics.test_rows, 200);
        }
        other => panic!("expected a trained model, got {:?}", other),
    }

    let active = pipeline.registry().get(Pollutant::Pm25).await.unwrap();
    assert_eq!(active.version, 1);
    assert_eq!(active.training_rows, 1000);
}

#[tokio::test]
async fn test_skipped_retrain_keeps_previous_model() {
    let pool = memory_pool().await;
    canonical::upsert_records(&pool, &canonical_series(LAT, LON, 0..1000))
        .await
        .unwrap();

    let trainer = pipeline_with(pool.clone(), fast_config(), vec![]);
    trainer.run_retrain(Some(Pollutant::Pm25)).await;

    // Restart with a stricter floor: the persisted model is restored and survives a skip
    let mut strict = fast_config();
    strict.trainer.min_rows = 5000;
    let restarted = Pipeline::with_adapters(pool, strict, EventBus::new(10), vec![]);
    assert_eq!(restarted.registry().load_persisted().await.unwrap(), 1);

    let status = restarted.run_retrain(Some(Pollutant::Pm25)).await;
    assert!(matches!(
        status.outcomes[&Pollutant::Pm25],
        TrainingOutcome::Skipped { .. }
    ));
    let active = restarted.registry().get(Pollutant::Pm25).await.unwrap();
    assert_eq!(active.version, 1);
}

#[tokio::test]
async fn test_default_retrain_reports_every_default_pollutant() {
    let pool = memory_pool().await;
    canonical::upsert_records(&pool, &canonical_series(LAT, LON, 0..1000))
        .await
        .unwrap();
    let pipeline = pipeline_with(pool, fast_config(), vec![]);

    let status = pipeline.run_retrain(None).await;

    // Other pollutants have no data, which is a skip, not a failure
    assert!(status.ok);
    assert_eq!(status.outcomes.len(), 4);
    assert!(matches!(
        status.outcomes[&Pollutant::Pm25],
        TrainingOutcome::Trained { .. }
    ));
    for pollutant in [Pollutant::Pm10, Pollutant::O3, Pollutant::No2] {
        assert_eq!(
            status.outcomes[&pollutant],
            TrainingOutcome::Skipped {
                available: 0,
                required: 1000
            }
        );
    }
    assert_eq!(status.processed, 1);
}

#[tokio::test]
async fn test_retrain_bumps_version() {
    let pool = memory_pool().await;
    canonical::upsert_records(&pool, &canonical_series(LAT, LON, 0..1000))
        .await
        .unwrap();
    let pipeline = pipeline_with(pool, fast_config(), vec![]);

    pipeline.run_retrain(Some(Pollutant::Pm25)).await;
    pipeline.run_retrain(Some(Pollutant::Pm25)).await;

    let active = pipeline.registry().get(Pollutant::Pm25).await.unwrap();
    assert_eq!(active.version, 2);
}
