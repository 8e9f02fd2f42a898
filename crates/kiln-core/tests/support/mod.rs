//! Shared fixtures for the engine integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::PgPool;
use uuid::Uuid;

use kiln_core::agent::{AgentExecutor, AgentOutcome, MockAgentExecutor};
use kiln_core::artifacts::{ArtifactService, LocalContentStore};
use kiln_core::audit::PgAuditSink;
use kiln_core::billing::MemoryBillingClient;
use kiln_core::events::EventHub;
use kiln_core::executor::PipelineExecutor;
use kiln_core::retry::{RetryWorker, RetryWorkerConfig};
use kiln_db::models::{AgentType, AuditEvent, TaskStatus};
use kiln_db::queries::{audit as audit_db, projects as project_db, tasks as task_db};
use kiln_test_utils::TestDb;

/// Marker for "fail forever".
const ALWAYS: u32 = u32::MAX;

/// Agent executor with scriptable failures layered over the canned mock.
pub struct ScriptedAgent {
    inner: MockAgentExecutor,
    /// Remaining failures per agent type; `ALWAYS` never decrements.
    failures: Mutex<HashMap<AgentType, u32>>,
}

impl ScriptedAgent {
    pub fn new() -> Self {
        Self {
            inner: MockAgentExecutor::new(),
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Make the next `times` invocations of this agent fail.
    pub fn fail_times(&self, agent_type: AgentType, times: u32) {
        self.failures.lock().unwrap().insert(agent_type, times);
    }

    /// Make every invocation of this agent fail.
    pub fn fail_always(&self, agent_type: AgentType) {
        self.failures.lock().unwrap().insert(agent_type, ALWAYS);
    }
}

#[async_trait]
impl AgentExecutor for ScriptedAgent {
    fn model(&self) -> &str {
        self.inner.model()
    }

    async fn execute(
        &self,
        agent_type: AgentType,
        inputs: &serde_json::Value,
    ) -> anyhow::Result<AgentOutcome> {
        {
            let mut failures = self.failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(&agent_type) {
                if *remaining > 0 {
                    if *remaining != ALWAYS {
                        *remaining -= 1;
                    }
                    anyhow::bail!("scripted failure for {agent_type}");
                }
            }
        }
        self.inner.execute(agent_type, inputs).await
    }
}

/// Fully wired engine over a temp database, an in-memory billing ledger,
/// and a scriptable agent.
pub struct Harness {
    pub db: TestDb,
    pub tenant_id: Uuid,
    pub executor: PipelineExecutor,
    pub billing: Arc<MemoryBillingClient>,
    pub agents: Arc<ScriptedAgent>,
    pub hub: Arc<EventHub>,
    _artifact_dir: tempfile::TempDir,
}

impl Harness {
    /// Create a harness whose tenant starts with the given balance.
    pub async fn with_balance(balance: i64) -> Self {
        let db = TestDb::create().await;
        let tenant_id = Uuid::new_v4();
        let billing = Arc::new(MemoryBillingClient::with_balance(
            tenant_id,
            Decimal::from(balance),
        ));
        let agents = Arc::new(ScriptedAgent::new());
        let hub = Arc::new(EventHub::new());
        let artifact_dir = tempfile::tempdir().expect("tempdir");

        let executor = PipelineExecutor {
            pool: db.pool.clone(),
            agents: agents.clone(),
            billing: billing.clone(),
            artifacts: ArtifactService::new(
                db.pool.clone(),
                Arc::new(LocalContentStore::new(artifact_dir.path())),
            ),
            audit: Arc::new(PgAuditSink::new(db.pool.clone())),
            hub: hub.clone(),
        };

        Self {
            db,
            tenant_id,
            executor,
            billing,
            agents,
            hub,
            _artifact_dir: artifact_dir,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.db.pool
    }

    /// Seed a project and a queued task ready for the executor.
    pub async fn queued_task(&self, input_spec: serde_json::Value) -> Uuid {
        let project = project_db::insert_project(self.pool(), self.tenant_id, "proj", None)
            .await
            .expect("insert project");
        let task = task_db::insert_task(
            self.pool(),
            project.id,
            self.tenant_id,
            "build",
            &input_spec,
        )
        .await
        .expect("insert task");
        task_db::transition_task_status(self.pool(), task.id, TaskStatus::Draft, TaskStatus::Queued)
            .await
            .expect("queue task");
        task.id
    }

    /// A retry worker over the same engine, with the default policy.
    pub fn worker(&self) -> RetryWorker {
        RetryWorker::new(self.executor.clone(), RetryWorkerConfig::default())
    }

    /// Pull every pending retry job into the past so the next worker
    /// tick picks it up.
    pub async fn make_retry_jobs_due(&self) {
        sqlx::query(
            "UPDATE retry_jobs SET scheduled_at = now() - interval '1 second' \
             WHERE status = 'pending'",
        )
        .execute(self.pool())
        .await
        .expect("make retry jobs due");
    }

    /// All audit events of a type for the harness tenant.
    pub async fn audit_events(&self, event_type: &str) -> Vec<AuditEvent> {
        audit_db::list_by_type(self.pool(), self.tenant_id, event_type)
            .await
            .expect("list audit events")
    }

    /// Tear down the temp database.
    pub async fn teardown(self) {
        self.db.drop().await;
    }
}
