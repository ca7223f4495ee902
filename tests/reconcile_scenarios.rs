//! End-to-end reconcile scenarios against the in-memory runtime.
//!
//! Each test parses a real desired-state document, wires the built-in plugin
//! pipeline and drives `Reconciler` ticks, then inspects what the runtime saw.

use std::sync::Arc;

use chrono::Utc;
use pretty_assertions::assert_eq;

use harbormaster::config::{Config, ConfigFormat};
use harbormaster::gc::CadaverSweeper;
use harbormaster::plugins::PluginRegistry;
use harbormaster::reconciler::Reconciler;
use harbormaster::runtime::{ContainerRuntime, ContainerStatus, labels};
use harbormaster::testing::{FakeRuntime, container, data_container, image, test_context_with};

fn setup(yaml: &str) -> (Arc<FakeRuntime>, Reconciler, Config) {
    let config = Config::parse_document(yaml, ConfigFormat::Yaml).expect("valid document");
    let runtime = Arc::new(FakeRuntime::new());
    let ctx = Arc::new(test_context_with(config.clone(), Arc::clone(&runtime)));
    let reconciler = Reconciler::new(ctx, PluginRegistry::with_builtins().pipeline());
    (runtime, reconciler, config)
}

// ── Worker sets ────────────────────────────────────────────────────────────

#[tokio::test]
async fn worker_set_starts_exactly_the_deficit() {
    let (runtime, reconciler, config) = setup(
        r#"
containers:
  web:
    image: nginx
    instances: 3
"#,
    );
    let web = config.container_set("web").unwrap();

    let report = reconciler.reconcile(web).await.unwrap();

    assert_eq!(report.attempted, 3);
    assert_eq!(report.started, 3);
    let created = runtime.created();
    assert_eq!(created.len(), 3);
    for request in &created {
        assert_eq!(request.image, "nginx:latest");
        assert_eq!(request.labels[labels::GROUP_ID], "web");
        assert_eq!(request.labels[labels::DATA_CONTAINER], "false");
        assert_eq!(request.labels[labels::AUTO_DEPLOYED], "true");
    }
    assert_eq!(runtime.started().len(), 3);

    // Converged: the next tick does nothing.
    let report = reconciler.reconcile(web).await.unwrap();
    assert_eq!(report.running, 3);
    assert_eq!(report.attempted, 0);
    assert_eq!(runtime.created().len(), 3);
}

#[tokio::test]
async fn worker_set_tops_up_after_a_container_dies() {
    let (runtime, reconciler, config) = setup(
        r#"
containers:
  web:
    image: nginx
    instances: 2
"#,
    );
    runtime.insert_container(container("alive", "web", ContainerStatus::Running));
    runtime.insert_container(container("gone", "web", ContainerStatus::Exited));

    let report = reconciler
        .reconcile(config.container_set("web").unwrap())
        .await
        .unwrap();

    assert_eq!(report.running, 1);
    assert_eq!(report.started, 1);
}

#[tokio::test]
async fn failed_attempts_do_not_stop_the_rest() {
    let (runtime, reconciler, config) = setup(
        r#"
containers:
  web:
    image: nginx
    instances: 2
"#,
    );
    runtime.set_fail_start(true);

    let report = reconciler
        .reconcile(config.container_set("web").unwrap())
        .await
        .unwrap();

    assert_eq!(report.attempted, 2);
    assert_eq!(report.failed, 2);
    // Created containers that failed to start are left for the operator.
    assert_eq!(runtime.containers().len(), 2);
    assert!(runtime.removed().is_empty());
}

#[tokio::test]
async fn hook_abort_prevents_create() {
    let (runtime, reconciler, config) = setup(
        r#"
containers:
  db:
    image: postgres
    isDataContainer: true
  app:
    image: myapp
    volumesFrom: [db]
"#,
    );

    let report = reconciler
        .reconcile(config.container_set("app").unwrap())
        .await
        .unwrap();

    assert_eq!(report.attempted, 1);
    assert_eq!(report.failed, 1);
    assert!(runtime.created().is_empty());
}

#[tokio::test]
async fn hooks_shape_the_request() {
    let (runtime, reconciler, config) = setup(
        r#"
minPort: 31000
maxPort: 31000
containers:
  db:
    image: postgres
    isDataContainer: true
  app:
    image: myapp
    randomPort: true
    ports: ["9090:90"]
    volumesFrom: [db]
    env:
      - "PUBLIC_URL=http://{{HOSTNAME}}:{{PORT}}"
"#,
    );
    runtime.insert_container(data_container("db1", "db", ContainerStatus::Running, "pgdata"));

    reconciler
        .reconcile(config.container_set("app").unwrap())
        .await
        .unwrap();

    let created = runtime.created();
    assert_eq!(created.len(), 1);
    let request = &created[0];
    assert_eq!(request.env_value("PORT"), Some("31000"));
    assert_eq!(
        request.env_value("PUBLIC_URL"),
        Some("http://fake-host:31000")
    );
    assert_eq!(request.port_bindings["31000/tcp"], 31000);
    assert_eq!(request.port_bindings["90/tcp"], 9090);
    assert_eq!(request.volumes_from, vec!["db1"]);
    assert_eq!(request.binds, vec!["pgdata:/data/pgdata"]);
}

#[tokio::test]
async fn scale_down_is_off_by_default() {
    let (runtime, reconciler, config) = setup(
        r#"
containers:
  web:
    image: nginx
    instances: 1
"#,
    );
    for id in ["a", "b", "c"] {
        runtime.insert_container(container(id, "web", ContainerStatus::Running));
    }

    let report = reconciler
        .reconcile(config.container_set("web").unwrap())
        .await
        .unwrap();

    assert_eq!(report.removed, 0);
    assert_eq!(runtime.container_ids(), vec!["a", "b", "c"]);
}

#[tokio::test]
async fn scale_down_removes_oldest_excess() {
    let (runtime, reconciler, config) = setup(
        r#"
scaleDown: true
containers:
  web:
    image: nginx
    instances: 1
"#,
    );
    for (id, hours) in [("mid", 2), ("old", 5), ("new", 0)] {
        let mut c = container(id, "web", ContainerStatus::Running);
        c.created = Utc::now() - chrono::Duration::hours(hours);
        runtime.insert_container(c);
    }

    let report = reconciler
        .reconcile(config.container_set("web").unwrap())
        .await
        .unwrap();

    assert_eq!(report.removed, 2);
    assert_eq!(runtime.removed(), vec!["old", "mid"]);
    assert_eq!(runtime.container_ids(), vec!["new"]);
}

// ── Data sets ──────────────────────────────────────────────────────────────

const DATA_DOC: &str = r#"
containers:
  db:
    image: postgres
    isDataContainer: true
"#;

#[tokio::test]
async fn data_set_on_newest_image_is_left_alone() {
    let (runtime, reconciler, config) = setup(DATA_DOC);
    runtime.insert_image(image("sha1", &["postgres:latest"]));
    let mut member = data_container("db1", "db", ContainerStatus::Running, "pg");
    member.image_id = "sha1".to_string();
    runtime.insert_container(member);

    let report = reconciler
        .reconcile(config.container_set("db").unwrap())
        .await
        .unwrap();

    assert_eq!(report.attempted, 0);
    assert!(runtime.created().is_empty());
}

#[tokio::test]
async fn data_set_promotes_one_generation_per_image_change() {
    let (runtime, reconciler, config) = setup(DATA_DOC);
    let db = config.container_set("db").unwrap();
    runtime.insert_image(image("sha2", &["postgres:latest"]));
    let mut member = data_container("db1", "db", ContainerStatus::Running, "pg");
    member.image_id = "sha1".to_string();
    runtime.insert_container(member);

    let report = reconciler.reconcile(db).await.unwrap();
    assert_eq!(report.started, 1);
    assert_eq!(runtime.created()[0].labels[labels::DATA_CONTAINER], "true");

    // The new generation runs sha2, so nothing more happens.
    let report = reconciler.reconcile(db).await.unwrap();
    assert_eq!(report.attempted, 0);
    assert_eq!(runtime.created().len(), 1);
}

#[tokio::test]
async fn data_set_also_counts_stopped_members() {
    let (runtime, reconciler, config) = setup(DATA_DOC);
    runtime.insert_image(image("sha1", &["postgres:latest"]));
    let mut member = data_container("db1", "db", ContainerStatus::Exited, "pg");
    member.image_id = "sha1".to_string();
    runtime.insert_container(member);

    let report = reconciler
        .reconcile(config.container_set("db").unwrap())
        .await
        .unwrap();

    assert_eq!(report.attempted, 0);
}

#[tokio::test]
async fn data_set_without_local_image_does_nothing() {
    let (runtime, reconciler, config) = setup(DATA_DOC);
    runtime.insert_image(image("sha9", &["postgres:15"]));

    let report = reconciler
        .reconcile(config.container_set("db").unwrap())
        .await
        .unwrap();
    assert_eq!(report.attempted, 0);

    runtime.set_fail_list_images(true);
    assert!(
        reconciler
            .reconcile(config.container_set("db").unwrap())
            .await
            .is_err()
    );
    assert!(runtime.created().is_empty());
}

#[tokio::test]
async fn data_set_with_bare_volume_path_is_created_and_its_volume_retained() {
    let (runtime, reconciler, config) = setup(
        r#"
containers:
  db:
    image: postgres:16
    isDataContainer: true
    volumes:
      - "/var/lib/postgresql/data"
"#,
    );
    let db = config.container_set("db").unwrap();
    runtime.insert_image(image("sha1", &["postgres:16"]));

    let report = reconciler.reconcile(db).await.unwrap();

    assert_eq!(report.started, 1);
    assert_eq!(report.failed, 0);
    let request = runtime.created().remove(0);
    assert_eq!(request.volumes, vec!["/var/lib/postgresql/data"]);
    assert!(request.binds.is_empty());

    let member = runtime.containers().remove(0);
    let volumes: Vec<&str> = member.volume_names().collect();
    assert_eq!(volumes.len(), 1);
    assert_eq!(runtime.volume_names(), volumes);

    // A stopped sole generation is the newest, so GC keeps it and its volume.
    runtime.stop(&member.id, std::time::Duration::ZERO).await.unwrap();
    let ctx = Arc::new(test_context_with(config.clone(), Arc::clone(&runtime)));
    let sweep = CadaverSweeper::new(ctx).sweep().await;
    assert_eq!(sweep.retained, vec![member.id.clone()]);
    assert!(runtime.removed_volumes().is_empty());
    assert_eq!(runtime.volume_names().len(), 1);
}
