//! Automation listeners against an in-process server

use chrono::NaiveDate;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use trackbridge_automation::{CopyRequest, ProjectCopier, ProjectCopyListener, ShotTaskListener, ACTION_IDENTIFIER};
use trackbridge_common::config::{ProjectCopySettings, ShotTaskSettings};
use trackbridge_common::memory::{MemoryConnector, MemoryHub, MemoryStore};
use trackbridge_common::store::{datetime_value, entity_ref};
use trackbridge_common::{EventHub, Listener, RawEvent, Record, RetryPolicy};

/// Project "Pilot" running Jan 1 to Jan 31 with two sequences, a shot, a
/// task and a milestone
fn pilot_project(store: &MemoryStore) -> Record {
    let start = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap();
    let end = NaiveDate::from_ymd_opt(2026, 1, 31).unwrap().and_hms_opt(0, 0, 0).unwrap();
    let project = store.insert(
        "Project",
        json!({
            "name": "pilot",
            "full_name": "Pilot",
            "project_schema": entity_ref("ProjectSchema", "schema-1"),
            "start_date": datetime_value(start),
            "end_date": datetime_value(end),
        }),
    );
    store.insert(
        "ContextCustomAttributeValue",
        json!({"entity_id": project.id, "configuration_id": "fps", "value": 24}),
    );

    let animation = store.insert("Type", json!({"name": "Animation"}));
    let wip = store.insert("Status", json!({"name": "In Progress"}));

    let later = store.insert(
        "Sequence",
        json!({"name": "sq020", "position": 2, "parent": entity_ref("Project", &project.id)}),
    );
    let first = store.insert(
        "Sequence",
        json!({"name": "sq010", "position": 1, "parent": entity_ref("Project", &project.id)}),
    );
    let shot = store.insert(
        "Shot",
        json!({"name": "sh010", "position": 1, "parent": entity_ref("Sequence", &first.id)}),
    );
    store.insert(
        "Task",
        json!({
            "name": "Animation",
            "parent": entity_ref("Shot", &shot.id),
            "type": entity_ref("Type", &animation.id),
            "status": entity_ref("Status", &wip.id),
        }),
    );
    store.insert(
        "Milestone",
        json!({"name": "Delivery", "position": 3, "parent": entity_ref("Project", &project.id)}),
    );
    store.insert(
        "Shot",
        json!({"name": "sh900", "parent": entity_ref("Sequence", &later.id)}),
    );
    project
}

fn copy_request(source: &Record, name: &str) -> CopyRequest {
    CopyRequest {
        source_project_id: source.id.clone(),
        new_project_name: name.to_string(),
        new_start_date: NaiveDate::from_ymd_opt(2026, 5, 1).unwrap(),
        user_id: Some("u-1".to_string()),
    }
}

fn children_of(store: &MemoryStore, entity_type: &str, parent_id: &str) -> Vec<Record> {
    store
        .all(entity_type)
        .into_iter()
        .filter(|r| r.path_str("parent.id") == Some(parent_id))
        .collect()
}

fn job_description(job: &Record) -> String {
    let data: Value = serde_json::from_str(job.str("data").unwrap()).unwrap();
    data["description"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_copy_clones_tree_in_position_order() {
    let store = Arc::new(MemoryStore::new("PBV"));
    let source = pilot_project(&store);
    let copier = ProjectCopier::new(store.clone());

    let new_id = copier.run_job(&copy_request(&source, "Pilot Season Two")).await.unwrap();

    let project = store.find("Project", &new_id).unwrap();
    assert_eq!(project.str("name"), Some("pilot_season_two"));
    assert_eq!(project.path_str("project_schema.id"), Some("schema-1"));
    assert_eq!(project.path_str("end_date.value"), Some("2026-05-31T00:00:00"));

    let sequences: Vec<String> = children_of(&store, "Sequence", &new_id)
        .iter()
        .map(|s| s.str("name").unwrap().to_string())
        .collect();
    assert_eq!(sequences, vec!["sq010", "sq020"]);
    assert_eq!(children_of(&store, "Milestone", &new_id).len(), 1);
    assert_eq!(store.count("Shot"), 4);

    let tasks = store.all("Task");
    let copied_task = tasks.last().unwrap();
    assert_ne!(copied_task.id, tasks[0].id);
    assert!(copied_task.get("type").is_some());
    assert!(copied_task.get("status").is_none());

    let attributes = store.all("ContextCustomAttributeValue");
    assert!(attributes.iter().any(|a| a.str("entity_id") == Some(new_id.as_str())));

    let job = store.all("Job").remove(0);
    assert_eq!(job.str("status"), Some("done"));
    assert_eq!(job.str("user_id"), Some("u-1"));
    assert!(job_description(&job).contains("Successfully copied"));
}

#[tokio::test]
async fn test_copy_rejects_existing_full_name() {
    let store = Arc::new(MemoryStore::new("PBV"));
    let source = pilot_project(&store);
    let copier = ProjectCopier::new(store.clone());

    let err = copier.run_job(&copy_request(&source, "Pilot")).await.unwrap_err();

    assert!(err.to_string().contains("already exists"));
    assert_eq!(store.count("Project"), 1);
    let job = store.all("Job").remove(0);
    assert_eq!(job.str("status"), Some("failed"));
    assert!(job_description(&job).starts_with("ERROR"));
}

#[tokio::test]
async fn test_copy_of_missing_project_fails_job() {
    let store = Arc::new(MemoryStore::new("PBV"));
    let copier = ProjectCopier::new(store.clone());
    let request = CopyRequest {
        source_project_id: "gone".into(),
        new_project_name: "Orphan".into(),
        new_start_date: NaiveDate::from_ymd_opt(2026, 5, 1).unwrap(),
        user_id: None,
    };

    assert!(copier.run_job(&request).await.is_err());
    assert_eq!(store.all("Job")[0].str("status"), Some("failed"));
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_copy_action_round_trip() {
    let store = Arc::new(MemoryStore::new("PBV"));
    let source = pilot_project(&store);
    let hub = Arc::new(MemoryHub::new("PBV"));
    let connector = MemoryConnector::new().with_server("TB_ORIGIN", store.clone(), hub.clone());

    let mut listener = ProjectCopyListener::new(ProjectCopySettings::default(), Arc::new(connector));
    listener.connect().await.unwrap();
    let shutdown = CancellationToken::new();
    let running = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { listener.run(shutdown).await }
    });
    wait_until(|| hub.subscriber_count() == 1).await;

    hub.publish(RawEvent::new("ftrack.action.discover", json!({}))).await;
    wait_until(|| hub.replies().len() == 1).await;
    assert_eq!(hub.replies()[0].data["items"][0]["actionIdentifier"], ACTION_IDENTIFIER);

    // Other actions' launches are ignored
    hub.publish(RawEvent::new("ftrack.action.launch", json!({"actionIdentifier": "other"})))
        .await;

    let mut open_form = RawEvent::new("ftrack.action.launch", json!({"actionIdentifier": ACTION_IDENTIFIER}));
    open_form.source = json!({"user": {"id": "u-7"}});
    hub.publish(open_form).await;
    wait_until(|| hub.replies().len() == 2).await;
    let form = hub.replies()[1].data.clone();
    assert_eq!(form["type"], "form");
    assert_eq!(form["items"][2]["value"], "u-7");

    hub.publish(RawEvent::new(
        "ftrack.action.launch",
        json!({
            "actionIdentifier": ACTION_IDENTIFIER,
            "values": {"source_project_id": source.id, "new_project_name": "", "new_start_date": "2026-05-01"},
        }),
    ))
    .await;
    wait_until(|| hub.replies().len() == 3).await;
    assert_eq!(hub.replies()[2].data["success"], false);
    assert_eq!(store.count("Job"), 0);

    hub.publish(RawEvent::new(
        "ftrack.action.launch",
        json!({
            "actionIdentifier": ACTION_IDENTIFIER,
            "values": {
                "source_project_id": source.id,
                "new_project_name": "Pilot Redux",
                "new_start_date": "2026-05-01",
                "user_id": "u-7",
            },
        }),
    ))
    .await;
    wait_until(|| hub.replies().len() == 4).await;
    assert_eq!(hub.replies()[3].data["success"], true);
    assert_eq!(store.count("Project"), 2);

    shutdown.cancel();
    assert!(running.await.unwrap().is_ok());
    assert!(hub.is_closed());
}

#[tokio::test]
async fn test_shot_listener_templates_new_shots() {
    let store = Arc::new(MemoryStore::new("PBV"));
    for name in ["Animation", "Lighting", "Compositing"] {
        store.insert("Type", json!({"name": name}));
    }
    let hub = Arc::new(MemoryHub::new("PBV"));
    let connector = MemoryConnector::new().with_server("TB_ORIGIN", store.clone(), hub.clone());

    let mut listener = ShotTaskListener::new(
        ShotTaskSettings::default(),
        RetryPolicy::fixed(3, Duration::from_millis(1)),
        Arc::new(connector),
    );
    listener.connect().await.unwrap();
    let shutdown = CancellationToken::new();
    let running = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { listener.run(shutdown).await }
    });
    wait_until(|| hub.subscriber_count() == 1).await;

    let shot = store.insert("Shot", json!({"name": "sh010"}));
    hub.publish_entity("ftrack.update", "Shot", "add", &shot.id).await;
    // Task events are not this listener's business
    hub.publish_entity("ftrack.update", "Task", "add", "t-1").await;

    wait_until(|| store.count("Task") == 3).await;

    shutdown.cancel();
    assert!(running.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_shot_listener_reports_closed_hub() {
    let store = Arc::new(MemoryStore::new("PBV"));
    let hub = Arc::new(MemoryHub::new("PBV"));
    let connector = MemoryConnector::new().with_server("TB_ORIGIN", store, hub.clone());

    let mut listener = ShotTaskListener::new(ShotTaskSettings::default(), RetryPolicy::default(), Arc::new(connector));
    listener.connect().await.unwrap();
    let running = tokio::spawn(async move { listener.run(CancellationToken::new()).await });
    wait_until(|| hub.subscriber_count() == 1).await;

    hub.close();
    assert!(running.await.unwrap().is_err());
}
