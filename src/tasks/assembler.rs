//! Input assembler — joins a task row with its auxiliary lookups.
//!
//! The three lookups (prior-stage outputs, participants, form types) have
//! no ordering dependency and run concurrently. Any failure aborts the
//! assembly; a worker never sees a partially-resolved payload.

use futures::future::OptionFuture;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{AssemblyLookup, DatabaseError, SupervisorError};
use crate::store::traits::TaskSource;
use crate::tasks::model::{AgentInfo, FormType, Task, TaskId, UserInfo};

/// Everything a worker process needs to run one task.
///
/// Built once before the worker starts and handed over as JSON.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerInput {
    pub todo_id: TaskId,
    pub current_activity_name: String,
    pub all_previous_outputs: Map<String, Value>,
    pub task_instructions: String,
    /// Tools of the first agent participant; `null` when there is none.
    pub tools: Option<String>,
    pub agent_info: Vec<AgentInfo>,
    pub user_info: Vec<UserInfo>,
    pub tenant_id: String,
    pub form_id: String,
    pub form_types: Vec<FormType>,
    pub proc_inst_id: Option<String>,
}

impl WorkerInput {
    /// Serialize for the `--inputs` argument. Non-ASCII text is kept as is.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

fn lookup_failed(task_id: &TaskId, lookup: AssemblyLookup, source: DatabaseError) -> SupervisorError {
    SupervisorError::TaskAssembly {
        task_id: task_id.clone(),
        lookup,
        source,
    }
}

/// Build the worker payload for `task`.
pub async fn assemble_input(
    source: &dyn TaskSource,
    task: &Task,
) -> Result<WorkerInput, SupervisorError> {
    let proc_inst_id = task.effective_proc_inst_id();
    let tenant_id = task.tenant_id.as_deref().unwrap_or_default();
    let tool = task.tool.as_deref().unwrap_or_default();

    let previous = async {
        match proc_inst_id {
            Some(id) => source
                .fetch_previous_output(id)
                .await
                .map_err(|e| lookup_failed(&task.id, AssemblyLookup::PreviousOutput, e)),
            None => Ok(Map::new()),
        }
    };

    let participants = async {
        OptionFuture::from(task.participant_ids().map(|ids| source.fetch_participants_info(ids)))
            .await
            .transpose()
            .map(Option::unwrap_or_default)
            .map_err(|e| lookup_failed(&task.id, AssemblyLookup::Participants, e))
    };

    let forms = async {
        source
            .fetch_form_types(tool, tenant_id)
            .await
            .map_err(|e| lookup_failed(&task.id, AssemblyLookup::FormTypes, e))
    };

    let (all_previous_outputs, participants, (form_id, form_types)) =
        tokio::try_join!(previous, participants, forms)?;

    debug!(
        task_id = %task.id,
        previous_outputs = all_previous_outputs.len(),
        agents = participants.agent_info.len(),
        form_id = %form_id,
        "Worker input assembled"
    );

    Ok(WorkerInput {
        todo_id: task.id.clone(),
        current_activity_name: task.activity_name.clone().unwrap_or_default(),
        all_previous_outputs,
        task_instructions: task.description.clone().unwrap_or_default(),
        tools: participants.primary_tools(),
        agent_info: participants.agent_info,
        user_info: participants.user_info,
        tenant_id: tenant_id.to_string(),
        form_id,
        form_types,
        proc_inst_id: proc_inst_id.map(str::to_string),
    })
}
