use crate::auth::TokenIssuer;
use shared::{
    domain::{MessageKind, ProposalId, ProposalStatus, RoomId, UserId},
    error::{ApiError, ErrorCode},
    protocol::{
        ChatMessage, NewMessage, NewProposal, Proposal, ProposalWithMessage, Room,
    },
};
use storage::Storage;

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
    pub tokens: TokenIssuer,
}

pub async fn list_rooms(ctx: &ApiContext, user_id: &UserId) -> Result<Vec<Room>, ApiError> {
    ctx.storage
        .list_rooms_for_user(user_id)
        .await
        .map_err(internal)
}

pub async fn general_room(
    ctx: &ApiContext,
    user_id: &UserId,
    other_user_id: &UserId,
) -> Result<Room, ApiError> {
    if other_user_id.is_blank() {
        return Err(ApiError::new(ErrorCode::Validation, "other_user_id is required"));
    }
    if other_user_id == user_id {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "cannot open a room with yourself",
        ));
    }
    ctx.storage
        .get_or_create_general_room(user_id, other_user_id)
        .await
        .map_err(internal)
}

pub async fn list_messages(
    ctx: &ApiContext,
    user_id: &UserId,
    room_id: &RoomId,
) -> Result<Vec<ChatMessage>, ApiError> {
    ensure_participant(ctx, room_id, user_id).await?;
    ctx.storage.list_messages(room_id).await.map_err(internal)
}

pub async fn send_message(
    ctx: &ApiContext,
    user_id: &UserId,
    room_id: &RoomId,
    message: &NewMessage,
) -> Result<ChatMessage, ApiError> {
    ensure_participant(ctx, room_id, user_id).await?;
    match message.kind {
        MessageKind::Text if message.content.trim().is_empty() => {
            return Err(ApiError::new(ErrorCode::Validation, "message content is empty"));
        }
        MessageKind::Image if message.attachment_url.is_none() => {
            return Err(ApiError::new(
                ErrorCode::Validation,
                "image messages need an attachment_url",
            ));
        }
        MessageKind::BudgetProposal => {
            return Err(ApiError::new(
                ErrorCode::Validation,
                "budget messages are created through proposals",
            ));
        }
        _ => {}
    }
    ctx.storage
        .insert_message(room_id, user_id, message)
        .await
        .map_err(internal)
}

/// Marks the other participant's messages read and returns the changed rows.
pub async fn mark_read(
    ctx: &ApiContext,
    user_id: &UserId,
    room_id: &RoomId,
) -> Result<Vec<ChatMessage>, ApiError> {
    ensure_participant(ctx, room_id, user_id).await?;
    ctx.storage.mark_read(room_id, user_id).await.map_err(internal)
}

pub async fn list_proposals(
    ctx: &ApiContext,
    user_id: &UserId,
    room_id: &RoomId,
) -> Result<Vec<Proposal>, ApiError> {
    ensure_participant(ctx, room_id, user_id).await?;
    ctx.storage.list_proposals(room_id).await.map_err(internal)
}

pub async fn create_proposal(
    ctx: &ApiContext,
    user_id: &UserId,
    room_id: &RoomId,
    proposal: &NewProposal,
) -> Result<ProposalWithMessage, ApiError> {
    let room = ensure_participant(ctx, room_id, user_id).await?;
    if &proposal.recipient_id != room.other_participant(user_id) {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "recipient must be the other participant",
        ));
    }
    let valid_amounts = proposal.amount_min.is_finite()
        && proposal.amount_max.is_finite()
        && proposal.amount_min >= 0.0
        && proposal.amount_min <= proposal.amount_max;
    if !valid_amounts {
        return Err(ApiError::new(ErrorCode::Validation, "invalid budget range"));
    }
    ctx.storage
        .insert_proposal_with_message(room_id, user_id, proposal)
        .await
        .map_err(internal)
}

pub async fn proposal(
    ctx: &ApiContext,
    user_id: &UserId,
    proposal_id: &ProposalId,
) -> Result<Proposal, ApiError> {
    let proposal = ctx
        .storage
        .proposal(proposal_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "proposal not found"))?;
    ensure_participant(ctx, &proposal.room_id, user_id).await?;
    Ok(proposal)
}

/// Only the recipient may settle a pending proposal.
pub async fn respond_to_proposal(
    ctx: &ApiContext,
    user_id: &UserId,
    proposal_id: &ProposalId,
    status: ProposalStatus,
) -> Result<Proposal, ApiError> {
    if !matches!(status, ProposalStatus::Accepted | ProposalStatus::Declined) {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "a proposal can only be accepted or declined",
        ));
    }
    let current = proposal(ctx, user_id, proposal_id).await?;
    if &current.recipient_id != user_id {
        return Err(ApiError::new(
            ErrorCode::Forbidden,
            "only the recipient can respond",
        ));
    }
    if current.status != ProposalStatus::Pending {
        return Err(ApiError::new(
            ErrorCode::Conflict,
            format!("proposal is already {}", current.status.as_str()),
        ));
    }
    ctx.storage
        .update_proposal_status(proposal_id, status)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "proposal not found"))
}

/// Row-level access rule: a room and its rows are visible to its two participants only.
pub async fn ensure_participant(
    ctx: &ApiContext,
    room_id: &RoomId,
    user_id: &UserId,
) -> Result<Room, ApiError> {
    let room = ctx
        .storage
        .room(room_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "room not found"))?;
    if !room.has_participant(user_id) {
        return Err(ApiError::new(ErrorCode::Forbidden, "user is not a participant"));
    }
    Ok(room)
}

fn internal(err: anyhow::Error) -> ApiError {
    ApiError::new(ErrorCode::Internal, format!("{err:#}"))
}

#[cfg(test)]
#[path = "tests/mod_tests.rs"]
mod tests;
