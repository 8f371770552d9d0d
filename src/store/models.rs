use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub path: String,
    pub follow_up_mode: FollowUpMode,
    pub created_at: String,
}

/// What happens when the user sends another message while an agent runs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FollowUpMode {
    Interrupt,
    Queue,
}

impl FollowUpMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Interrupt => "interrupt",
            Self::Queue => "queue",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "interrupt" => Ok(Self::Interrupt),
            "queue" => Ok(Self::Queue),
            _ => Err(format!("Invalid follow-up mode: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ThreadMode {
    Local,
    Worktree,
}

impl ThreadMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Worktree => "worktree",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "local" => Ok(Self::Local),
            "worktree" => Ok(Self::Worktree),
            _ => Err(format!("Invalid thread mode: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ThreadStatus {
    Idle,
    Pending,
    Running,
    Waiting,
    Completed,
    Failed,
    Stopped,
    Interrupted,
}

impl ThreadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Waiting => "waiting",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
            Self::Interrupted => "interrupted",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "idle" => Ok(Self::Idle),
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "waiting" => Ok(Self::Waiting),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "stopped" => Ok(Self::Stopped),
            "interrupted" => Ok(Self::Interrupted),
            _ => Err(format!("Invalid thread status: {}", s)),
        }
    }

    /// Terminal w.r.t. an agent run. `stopped` and `interrupted` are both
    /// terminal with no implicit transition between them.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Stopped | Self::Interrupted
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ThreadStage {
    Backlog,
    InProgress,
    Review,
    Done,
    Archived,
}

impl ThreadStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Backlog => "backlog",
            Self::InProgress => "in_progress",
            Self::Review => "review",
            Self::Done => "done",
            Self::Archived => "archived",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "backlog" => Ok(Self::Backlog),
            "in_progress" => Ok(Self::InProgress),
            "review" => Ok(Self::Review),
            "done" => Ok(Self::Done),
            "archived" => Ok(Self::Archived),
            _ => Err(format!("Invalid thread stage: {}", s)),
        }
    }
}

/// Why a `waiting` thread is waiting.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WaitingReason {
    Question,
    Plan,
    Permission,
}

impl WaitingReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Question => "question",
            Self::Plan => "plan",
            Self::Permission => "permission",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "question" => Ok(Self::Question),
            "plan" => Ok(Self::Plan),
            "permission" => Ok(Self::Permission),
            _ => Err(format!("Invalid waiting reason: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    pub id: i64,
    pub project_id: i64,
    pub title: String,
    pub mode: ThreadMode,
    pub status: ThreadStatus,
    pub stage: ThreadStage,
    pub provider: String,
    pub model: Option<String>,
    pub permission_mode: String,
    pub branch: Option<String>,
    pub base_branch: Option<String>,
    pub worktree_path: Option<String>,
    pub session_id: Option<String>,
    pub cost_usd: f64,
    pub pinned: bool,
    pub archived: bool,
    pub waiting_reason: Option<WaitingReason>,
    pub automation_id: Option<i64>,
    pub external_request_id: Option<String>,
    pub result_recorded: bool,
    pub created_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            _ => Err(format!("Invalid role: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub thread_id: i64,
    pub role: Role,
    pub content: String,
    /// JSON array of image attachments (base64 or paths), empty if none.
    pub images: Vec<String>,
    pub model: Option<String>,
    pub permission_mode: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: i64,
    pub message_id: i64,
    /// Provider-side block id; used to route tool results back.
    pub tool_use_id: String,
    pub name: String,
    pub input: String,
    pub output: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageHistoryEntry {
    pub id: i64,
    pub thread_id: i64,
    pub from_stage: ThreadStage,
    pub to_stage: ThreadStage,
    pub changed_at: String,
}

/// Shell command run against the project on demand (dev server, build
/// watcher), streamed to the UI over `command:output`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartupCommand {
    pub id: i64,
    pub project_id: i64,
    pub command: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Automation {
    pub id: i64,
    pub project_id: i64,
    pub name: String,
    pub prompt: String,
    pub cron_expression: String,
    pub enabled: bool,
    pub max_runs: i64,
    pub last_run_at: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationRun {
    pub id: i64,
    pub automation_id: i64,
    pub thread_id: i64,
    pub status: String,
    pub started_at: String,
    pub completed_at: Option<String>,
}

/// Parameters for creating a thread; everything else defaults.
#[derive(Debug, Clone)]
pub struct NewThread {
    pub project_id: i64,
    pub title: String,
    pub mode: ThreadMode,
    pub provider: String,
    pub model: Option<String>,
    pub permission_mode: String,
    pub branch: Option<String>,
    pub base_branch: Option<String>,
    pub worktree_path: Option<String>,
    pub automation_id: Option<i64>,
    pub external_request_id: Option<String>,
}

impl NewThread {
    pub fn basic(project_id: i64, title: &str, provider: &str) -> Self {
        Self {
            project_id,
            title: title.to_string(),
            mode: ThreadMode::Local,
            provider: provider.to_string(),
            model: None,
            permission_mode: "default".to_string(),
            branch: None,
            base_branch: None,
            worktree_path: None,
            automation_id: None,
            external_request_id: None,
        }
    }
}
