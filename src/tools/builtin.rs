use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;

use super::{ToolContext, ToolDefinition, ToolHandler, ToolSet, ToolSource};
use crate::core::embedding::Embedder;
use crate::core::memory::MemorySystem;
use crate::core::scheduler::{EXECUTE_TASK_CALLBACK, ScheduleSpec, Scheduler};

const DEFAULT_SEARCH_LIMIT: usize = 3;
const MAX_SEARCH_LIMIT: usize = 20;

fn parse_args<T: for<'de> Deserialize<'de>>(tool: &str, args: &serde_json::Value) -> Result<T> {
    serde_json::from_value(args.clone())
        .map_err(|e| anyhow!("invalid arguments for {}: {}", tool, e))
}

// ── weather (confirmation required) ──

#[derive(Deserialize)]
struct WeatherArgs {
    city: String,
}

pub struct WeatherTool;

#[async_trait]
impl ToolHandler for WeatherTool {
    async fn call(&self, _ctx: &ToolContext, args: &serde_json::Value) -> Result<serde_json::Value> {
        let args: WeatherArgs = parse_args("get_weather_information", args)?;
        let conditions = ["sunny", "cloudy", "rainy", "snowy"];
        let pick = args.city.bytes().map(usize::from).sum::<usize>() % conditions.len();
        Ok(serde_json::json!(format!(
            "The weather in {} is {}.",
            args.city, conditions[pick]
        )))
    }
}

// ── local time ──

#[derive(Deserialize)]
struct LocalTimeArgs {
    #[serde(default)]
    location: Option<String>,
}

pub struct LocalTimeTool;

#[async_trait]
impl ToolHandler for LocalTimeTool {
    async fn call(&self, _ctx: &ToolContext, args: &serde_json::Value) -> Result<serde_json::Value> {
        let args: LocalTimeArgs = parse_args("get_local_time", args)?;
        Ok(serde_json::json!({
            "location": args.location.unwrap_or_else(|| "UTC".to_string()),
            "time": chrono::Utc::now().to_rfc3339(),
            "timezone": "UTC",
        }))
    }
}

// ── scheduling ──

#[derive(Deserialize)]
struct ScheduleTaskArgs {
    when: ScheduleSpec,
    description: String,
}

pub struct ScheduleTaskTool {
    scheduler: Arc<Scheduler>,
}

#[async_trait]
impl ToolHandler for ScheduleTaskTool {
    async fn call(&self, ctx: &ToolContext, args: &serde_json::Value) -> Result<serde_json::Value> {
        let args: ScheduleTaskArgs = parse_args("schedule_task", args)?;
        let schedule = self
            .scheduler
            .schedule(
                &ctx.conversation_id,
                &args.when,
                EXECUTE_TASK_CALLBACK,
                serde_json::json!({ "description": args.description }),
            )
            .await?;
        Ok(serde_json::json!({
            "task_id": schedule.id,
            "kind": schedule.kind.as_str(),
            "next_fire": schedule.next_fire.to_rfc3339(),
            "message": format!("Task scheduled for {}: {}", schedule.next_fire.to_rfc3339(), args.description),
        }))
    }
}

pub struct GetScheduledTasksTool {
    scheduler: Arc<Scheduler>,
}

#[async_trait]
impl ToolHandler for GetScheduledTasksTool {
    async fn call(&self, ctx: &ToolContext, _args: &serde_json::Value) -> Result<serde_json::Value> {
        let schedules = self.scheduler.list(Some(&ctx.conversation_id)).await?;
        let tasks: Vec<_> = schedules
            .iter()
            .map(|s| {
                serde_json::json!({
                    "task_id": s.id,
                    "description": s.description(),
                    "kind": s.kind.as_str(),
                    "cron": s.cron,
                    "next_fire": s.next_fire.to_rfc3339(),
                })
            })
            .collect();
        Ok(serde_json::json!({ "tasks": tasks }))
    }
}

#[derive(Deserialize)]
struct CancelTaskArgs {
    task_id: String,
}

pub struct CancelScheduledTaskTool {
    scheduler: Arc<Scheduler>,
}

#[async_trait]
impl ToolHandler for CancelScheduledTaskTool {
    async fn call(&self, _ctx: &ToolContext, args: &serde_json::Value) -> Result<serde_json::Value> {
        let args: CancelTaskArgs = parse_args("cancel_scheduled_task", args)?;
        self.scheduler.cancel(&args.task_id).await?;
        Ok(serde_json::json!(format!("Task {} has been cancelled.", args.task_id)))
    }
}

// ── knowledge search ──

#[derive(Deserialize)]
struct SearchArgs {
    query: String,
    #[serde(default)]
    limit: Option<usize>,
}

pub struct SearchKnowledgeTool {
    memory: Arc<MemorySystem>,
    embedder: Arc<dyn Embedder>,
}

#[async_trait]
impl ToolHandler for SearchKnowledgeTool {
    async fn call(&self, _ctx: &ToolContext, args: &serde_json::Value) -> Result<serde_json::Value> {
        let args: SearchArgs = parse_args("search_knowledge", args)?;
        let limit = args
            .limit
            .unwrap_or(DEFAULT_SEARCH_LIMIT)
            .clamp(1, MAX_SEARCH_LIMIT);
        let query = self.embedder.embed(&args.query).await?;
        let hits = self.memory.search_knowledge(&query, limit).await?;
        Ok(serde_json::json!({ "results": hits }))
    }
}

/// The tools every conversation gets.
pub struct BuiltinToolSource {
    scheduler: Arc<Scheduler>,
    memory: Arc<MemorySystem>,
    embedder: Arc<dyn Embedder>,
}

impl BuiltinToolSource {
    pub fn new(
        scheduler: Arc<Scheduler>,
        memory: Arc<MemorySystem>,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        Self {
            scheduler,
            memory,
            embedder,
        }
    }

    pub fn tool_set(&self) -> ToolSet {
        let mut set = ToolSet::new();

        set.register_with_confirmation(
            ToolDefinition::requires_confirmation(
                "get_weather_information",
                "Show the weather in a given city to the user. Requires the user's approval.",
                serde_json::json!({
                    "type": "object",
                    "properties": { "city": { "type": "string" } },
                    "required": ["city"]
                }),
            ),
            Arc::new(WeatherTool),
        );

        set.register(ToolDefinition::auto(
            "get_local_time",
            "Get the current time for a location.",
            serde_json::json!({
                "type": "object",
                "properties": { "location": { "type": "string" } },
                "required": ["location"]
            }),
            Arc::new(LocalTimeTool),
        ));

        set.register(ToolDefinition::auto(
            "schedule_task",
            "Schedule a task to run later: at a date, after a delay in seconds, or on a cron schedule.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "when": {
                        "type": "object",
                        "properties": {
                            "type": { "type": "string", "enum": ["scheduled", "delayed", "cron", "no-schedule"] },
                            "date": { "type": "string", "description": "RFC 3339 timestamp for type=scheduled" },
                            "delayInSeconds": { "type": "integer", "minimum": 0 },
                            "cron": { "type": "string", "description": "5-field cron expression for type=cron" }
                        },
                        "required": ["type"]
                    },
                    "description": { "type": "string" }
                },
                "required": ["when", "description"]
            }),
            Arc::new(ScheduleTaskTool {
                scheduler: self.scheduler.clone(),
            }),
        ));

        set.register(ToolDefinition::auto(
            "get_scheduled_tasks",
            "List the tasks scheduled in this conversation.",
            serde_json::json!({ "type": "object", "properties": {} }),
            Arc::new(GetScheduledTasksTool {
                scheduler: self.scheduler.clone(),
            }),
        ));

        set.register(ToolDefinition::auto(
            "cancel_scheduled_task",
            "Cancel a scheduled task by its id.",
            serde_json::json!({
                "type": "object",
                "properties": { "task_id": { "type": "string" } },
                "required": ["task_id"]
            }),
            Arc::new(CancelScheduledTaskTool {
                scheduler: self.scheduler.clone(),
            }),
        ));

        set.register(ToolDefinition::auto(
            "search_knowledge",
            "Search the ingested knowledge base for passages related to a query.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string" },
                    "limit": { "type": "integer", "minimum": 1, "maximum": MAX_SEARCH_LIMIT }
                },
                "required": ["query"]
            }),
            Arc::new(SearchKnowledgeTool {
                memory: self.memory.clone(),
                embedder: self.embedder.clone(),
            }),
        ));

        set
    }
}

#[async_trait]
impl ToolSource for BuiltinToolSource {
    fn name(&self) -> &str {
        "builtin"
    }

    async fn load(&self) -> Result<ToolSet> {
        Ok(self.tool_set())
    }
}
