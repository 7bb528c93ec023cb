//! The two REST surfaces this core owns: session creation, and a
//! read-only agent listing for operational visibility. Auth, users,
//! templates, and quotas stay external; `owner` here is taken at face
//! value, trusted the same way an authenticated upstream gateway would be
//! expected to have already validated it.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use streamspace_protocol::{PlatformKind, ResourceRequest};

use crate::error::AppError;
use crate::session::{self, CreateSessionRequest};
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct AgentListItem {
    pub identity: String,
    pub platform_kind: PlatformKind,
    pub active_sessions: u32,
    pub cordoned: bool,
}

/// `GET /api/v1/agents` — operational visibility into the agent
/// registry, not part of the session-creation hot path.
pub async fn list_agents(State(state): State<AppState>) -> Result<Json<Vec<AgentListItem>>, AppError> {
    let agents = state.store.list_eligible_agents(None).await?;
    Ok(Json(
        agents
            .into_iter()
            .map(|a| AgentListItem {
                identity: a.identity,
                platform_kind: a.platform_kind,
                active_sessions: a.active_sessions,
                cordoned: a.cordoned,
            })
            .collect(),
    ))
}

#[derive(Debug, Deserialize)]
pub struct CreateSessionBody {
    pub owner: String,
    pub template: String,
    pub required_platform: Option<PlatformKind>,
    pub image: String,
    #[serde(default)]
    pub env: Vec<String>,
    pub resources: ResourceRequest,
    #[serde(default)]
    pub persistent_home: bool,
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub identity: String,
    pub owner: String,
    pub template_name: String,
    pub agent_identity: String,
    pub phase: streamspace_protocol::SessionPhase,
}

/// `POST /api/v1/sessions`: 202 with the session object in `pending`, or
/// an error (no agents available → 503, with no row written).
pub async fn create_session_handler(
    State(state): State<AppState>,
    Json(body): Json<CreateSessionBody>,
) -> Result<(StatusCode, Json<SessionResponse>), AppError> {
    if body.owner.trim().is_empty() || body.template.trim().is_empty() {
        return Err(AppError::Validation("owner and template are required".into()));
    }

    let session = session::create_session(
        state.store.as_ref(),
        state.quota.as_ref(),
        CreateSessionRequest {
            owner: body.owner,
            template_name: body.template,
            required_platform: body.required_platform,
            image: body.image,
            env: body.env,
            resources: body.resources,
            persistent_home: body.persistent_home,
        },
    )
    .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(SessionResponse {
            identity: session.identity,
            owner: session.owner,
            template_name: session.template_name,
            agent_identity: session.agent_identity,
            phase: session.phase,
        }),
    ))
}
