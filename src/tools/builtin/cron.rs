//! Cron tool: manage scheduled jobs from the loop.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};

use crate::cron::{CronJob, CronStore, NewJob};
use crate::tools::{tool_err, tool_ok, Tool};

pub struct CronTool {
    store: CronStore,
}

impl CronTool {
    pub fn new(store: CronStore) -> Self {
        Self { store }
    }
}

fn job_json(job: &CronJob) -> Value {
    json!({
        "id": job.id,
        "type": job.job_type.as_str(),
        "action": job.action,
        "schedule": job.schedule,
        "time": job.time.map(|t| t.to_rfc3339()),
        "interval_ms": job.interval_ms,
        "disabled": job.disabled,
        "last_fired": job.last_fired.map(|t| t.to_rfc3339()),
    })
}

#[async_trait]
impl Tool for CronTool {
    fn name(&self) -> &str {
        "cron"
    }

    fn capability(&self) -> String {
        "cron(op, ...) -> {success, ...}. Operations:\n\
         add(type: one_time|interval|schedule, action: {kind: bash, command} | \
         {kind: prompt, text}, time?|delay?|interval_ms?|schedule?) -> {id}\n\
         list() -> {jobs} / delete(id) / enable(id) / disable(id)\n\
         one_time needs time (RFC3339) or delay (seconds from now); interval \
         needs interval_ms; schedule needs {days: [0-6, 0=Sunday], hour, \
         minute}. Shorthand: a top-level 'message' becomes a prompt action, \
         'command' a bash action."
            .to_string()
    }

    fn positional_keys(&self) -> &[&str] {
        &["op"]
    }

    async fn run(&self, args: Value) -> anyhow::Result<Value> {
        let Some(op) = args["op"].as_str() else {
            return Ok(tool_err("Missing required 'op'"));
        };
        let op = op.to_string();
        let store = self.store.clone();

        let result = store.run(move |s| Ok(dispatch(s, &op, &args))).await?;
        Ok(result)
    }
}

fn dispatch(store: &CronStore, op: &str, args: &Value) -> Value {
    match op {
        "add" => match NewJob::from_spec(args, Utc::now()) {
            Ok(new) => match store.create(&new) {
                Ok(id) => tool_ok(json!({ "id": id })),
                Err(e) => tool_err(e.to_string()),
            },
            Err(e) => tool_err(e.to_string()),
        },
        "list" => match store.list() {
            Ok(jobs) => tool_ok(json!({
                "jobs": jobs.iter().map(job_json).collect::<Vec<_>>()
            })),
            Err(e) => tool_err(e.to_string()),
        },
        "delete" | "enable" | "disable" => {
            let Some(id) = args["id"].as_i64() else {
                return tool_err("Missing required 'id'");
            };
            let outcome = match op {
                "delete" => store.delete(id),
                "enable" => store.set_disabled(id, false),
                _ => store.set_disabled(id, true),
            };
            match outcome {
                Ok(true) => tool_ok(json!({ "id": id, "op": op })),
                Ok(false) => tool_err(format!("No cron job with id {id}")),
                Err(e) => tool_err(e.to_string()),
            }
        }
        other => tool_err(format!(
            "Unknown cron op '{other}'; expected add, list, delete, enable, or disable"
        )),
    }
}
