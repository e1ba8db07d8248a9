/// Workflow integration tests — publish, queue processing, retry and
/// one-shot generation through the public engine API.
use std::sync::Arc;

use worldsmith::config::WorkerConfig;
use worldsmith::core::registry::ModuleRegistry;
use worldsmith::llm::mock::{ScriptedGenerator, ScriptedReply};
use worldsmith::llm::{ConfiguredCredentials, Credentials, GenerationError};
use worldsmith::schema::ids::{OwnerId, WorldId};
use worldsmith::schema::job::JobStatus;
use worldsmith::schema::module::ModuleStatus;
use worldsmith::schema::world::WorldStatus;
use worldsmith::service::{QueueOutcome, Worker};
use worldsmith::store::{jobs, modules, worlds, Database};
use worldsmith::{ServiceError, WorldEngine};

const LORE_SCHEMA: &str = r#"[
    (
        key: "lore",
        label: "Lore",
        order: 1,
        fields: [
            (key: "summary", label: "Summary", required: true, max_length: Some(200)),
            (key: "aside", label: "Aside"),
        ],
    ),
]"#;

fn lore_engine(db: Database, generator: Arc<ScriptedGenerator>) -> WorldEngine {
    WorldEngine::builder()
        .database(db)
        .with_registry(ModuleRegistry::parse_ron(LORE_SCHEMA).unwrap())
        .with_prompts_ron(
            r#"(
                draft: "Draft ${module.label}: ${missing[*].key|join(\",\")}",
                final: "Write ${module.label} for ${world.name}. ${module.fields[*].line|join(\"; \")}",
                refine: "Refine ${field.label}: ${priorText}",
            )"#,
        )
        .generator(generator)
        .credentials(Arc::new(
            ConfiguredCredentials::new().with_owner(&OwnerId::new("author"), Credentials::new("author-key")),
        ))
        .build()
        .unwrap()
}

fn lore_world(engine: &WorldEngine, owner: &OwnerId, summary: &str) -> WorldId {
    let world = engine
        .create_world(owner, "Aster", Some("Islands in the sky"), &["wind"])
        .unwrap();
    engine
        .save_module_fields(&world.id, "lore", owner, &[("summary", summary)])
        .unwrap();
    world.id
}

fn load_world(engine: &WorldEngine, id: &WorldId) -> worldsmith::schema::world::World {
    engine.database().with_conn(|c| worlds::get(c, id)).unwrap()
}

#[tokio::test]
async fn single_module_world_is_activated_by_its_only_job() {
    let generator = Arc::new(ScriptedGenerator::new().with_text("  Aster floats.\n\n"));
    let engine = lore_engine(Database::in_memory().unwrap(), generator.clone());
    let owner = OwnerId::new("author");
    let world_id = lore_world(&engine, &owner, "Islands held up by old songs");

    let analysis = engine.prepare_publish(&world_id, &owner).unwrap();
    assert_eq!(analysis.modules_to_generate, vec!["lore"]);
    assert_eq!(analysis.jobs.len(), 1);

    let outcome = engine.process_queue().await;
    assert!(matches!(outcome, QueueOutcome::Succeeded { world_activated: true, .. }));

    let world = load_world(&engine, &world_id);
    assert_eq!(world.status, WorldStatus::Active);
    assert_eq!(world.version, 1);
    assert!(world.published_at.is_some());

    let module = engine
        .database()
        .with_conn(|c| modules::get(c, &world_id, "lore"))
        .unwrap();
    assert_eq!(module.status, ModuleStatus::Completed);
    assert_eq!(module.full_content.as_deref(), Some("Aster floats."));

    let calls = generator.calls();
    assert_eq!(calls[0].api_key, "author-key");
    assert_eq!(
        calls[0].prompt,
        "Write Lore for Aster. Summary: Islands held up by old songs"
    );
}

#[tokio::test]
async fn republishing_unchanged_world_activates_immediately() {
    let generator = Arc::new(ScriptedGenerator::new().with_text("Aster floats."));
    let engine = lore_engine(Database::in_memory().unwrap(), generator.clone());
    let owner = OwnerId::new("author");
    let world_id = lore_world(&engine, &owner, "Islands held up by old songs");

    engine.prepare_publish(&world_id, &owner).unwrap();
    engine.process_queue().await;

    for expected_version in [2, 3] {
        let analysis = engine.prepare_publish(&world_id, &owner).unwrap();
        assert!(analysis.activated());
        assert!(analysis.jobs.is_empty());
        assert_eq!(analysis.modules_to_reuse, vec!["lore"]);
        assert_eq!(analysis.world.status, WorldStatus::Active);
        assert_eq!(analysis.world.version, expected_version);
    }
    assert_eq!(generator.call_count(), 1);

    // Editing the module makes it stale again.
    engine
        .save_module_fields(&world_id, "lore", &owner, &[("summary", "Islands that sink at night")])
        .unwrap();
    let analysis = engine.prepare_publish(&world_id, &owner).unwrap();
    assert_eq!(analysis.modules_to_generate, vec!["lore"]);
    assert_eq!(analysis.world.status, WorldStatus::Generating);
}

#[test]
fn invalid_publish_leaves_everything_untouched() {
    let engine = lore_engine(
        Database::in_memory().unwrap(),
        Arc::new(ScriptedGenerator::new()),
    );
    let owner = OwnerId::new("author");
    let world_id = lore_world(&engine, &owner, &"x".repeat(201));

    let err = engine.prepare_publish(&world_id, &owner).unwrap_err();
    assert!(matches!(err, ServiceError::Validation(ref m) if m.contains("lore.summary")));

    let world = load_world(&engine, &world_id);
    assert_eq!(world.status, WorldStatus::Draft);
    assert_eq!(world.version, 0);
    let module = engine
        .database()
        .with_conn(|c| modules::get(c, &world_id, "lore"))
        .unwrap();
    assert_eq!(module.status, ModuleStatus::InProgress);
}

#[tokio::test]
async fn failed_job_waits_for_manual_retry() {
    let generator = Arc::new(
        ScriptedGenerator::new()
            .with_error(GenerationError::Server { status: 503, body: "overloaded".into() }),
    );
    let engine = lore_engine(Database::in_memory().unwrap(), generator.clone());
    let owner = OwnerId::new("author");
    let world_id = lore_world(&engine, &owner, "Islands held up by old songs");
    engine.prepare_publish(&world_id, &owner).unwrap();

    let outcome = engine.process_queue().await;
    assert!(matches!(outcome, QueueOutcome::Failed { ref error, .. } if error.contains("overloaded")));
    assert_eq!(engine.process_queue().await, QueueOutcome::Idle);
    assert_eq!(generator.call_count(), 1);
    assert_eq!(load_world(&engine, &world_id).status, WorldStatus::Generating);

    let job = engine.retry_module(&world_id, "lore", &owner).unwrap();
    assert_eq!(job.status, JobStatus::Waiting);
    assert_eq!(job.attempts, 1);

    generator.push(ScriptedReply::Text("Second time lucky.".into()));
    let outcome = engine.process_queue().await;
    assert!(matches!(outcome, QueueOutcome::Succeeded { world_activated: true, .. }));

    let job = engine
        .database()
        .with_conn(|c| jobs::find(c, &world_id, "lore"))
        .unwrap()
        .unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(job.attempts, 2);
    assert_eq!(load_world(&engine, &world_id).version, 1);
}

#[tokio::test]
async fn owner_without_credentials_fails_the_job() {
    let generator = Arc::new(ScriptedGenerator::new().with_text("unused"));
    let engine = lore_engine(Database::in_memory().unwrap(), generator.clone());
    let stranger = OwnerId::new("stranger");
    let world_id = lore_world(&engine, &stranger, "Islands held up by old songs");
    engine.prepare_publish(&world_id, &stranger).unwrap();

    assert!(matches!(engine.process_queue().await, QueueOutcome::Failed { .. }));
    assert_eq!(generator.call_count(), 0);

    let err = engine.generate_module(&world_id, "lore", &stranger).await.unwrap_err();
    assert!(matches!(err, ServiceError::PreconditionFailed(_)));
}

#[tokio::test]
async fn deleted_world_jobs_are_never_leased() {
    let generator = Arc::new(ScriptedGenerator::new().with_text("unused"));
    let engine = lore_engine(Database::in_memory().unwrap(), generator.clone());
    let owner = OwnerId::new("author");
    let world_id = lore_world(&engine, &owner, "Islands held up by old songs");
    engine.prepare_publish(&world_id, &owner).unwrap();

    engine
        .database()
        .with_conn(|c| worlds::soft_delete(c, &world_id, chrono::Utc::now()))
        .unwrap();
    assert_eq!(engine.process_queue().await, QueueOutcome::Idle);
    assert_eq!(generator.call_count(), 0);
}

#[tokio::test]
async fn queue_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("worlds.db");
    let owner = OwnerId::new("author");

    let world_id = {
        let engine = lore_engine(Database::open(&path).unwrap(), Arc::new(ScriptedGenerator::new()));
        let world_id = lore_world(&engine, &owner, "Islands held up by old songs");
        engine.prepare_publish(&world_id, &owner).unwrap();
        world_id
    };

    let generator = Arc::new(ScriptedGenerator::new().with_text("Aster floats."));
    let engine = lore_engine(Database::open(&path).unwrap(), generator);
    let worker = Worker::new(
        engine.clone(),
        WorkerConfig {
            poll_interval_ms: 10,
            idle_jitter_ms: 0,
            lease_timeout_secs: 600,
        },
    );
    assert_eq!(worker.recover().unwrap(), 0);
    let stats = worker.drain().await;
    assert_eq!(stats.succeeded, 1);

    let snapshot = engine.generation_status(&world_id, &owner).unwrap();
    assert_eq!(snapshot.status, WorldStatus::Active);
    assert!(snapshot.is_complete());
    assert_eq!(snapshot.jobs[0].module_status, Some(ModuleStatus::Completed));
}

#[tokio::test]
async fn draft_then_refine() {
    let generator = Arc::new(
        ScriptedGenerator::new()
            .with_text(r#"{"aside": "Nobody remembers the ground."}"#)
            .with_text("Nobody alive remembers the ground.\n"),
    );
    let engine = lore_engine(Database::in_memory().unwrap(), generator.clone());
    let owner = OwnerId::new("author");
    let world_id = lore_world(&engine, &owner, "Islands held up by old songs");

    let module = engine.generate_module(&world_id, "lore", &owner).await.unwrap();
    assert_eq!(module.field("summary"), Some("Islands held up by old songs"));
    assert_eq!(module.field("aside"), Some("Nobody remembers the ground."));
    assert_eq!(module.status, ModuleStatus::Ready);
    assert_eq!(generator.calls()[0].prompt, "Draft Lore: aside");

    let refined = engine
        .refine_field(
            &world_id,
            "lore",
            "aside",
            &owner,
            "Nobody remembers the ground.",
            None,
        )
        .await
        .unwrap();
    assert_eq!(refined, "Nobody alive remembers the ground.");
    assert_eq!(
        generator.calls()[1].prompt,
        "Refine Aside: Nobody remembers the ground."
    );

    // Refinement is not saved.
    let stored = engine
        .database()
        .with_conn(|c| modules::get(c, &world_id, "lore"))
        .unwrap();
    assert_eq!(stored.field("aside"), Some("Nobody remembers the ground."));
}
