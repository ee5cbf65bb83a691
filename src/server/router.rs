//! Verb dispatch table, handlers, and the push-delivery rules.
//!
//! Every handler follows the same skeleton: parse required fields, validate
//! the session if the verb needs one, call a store, translate the result to
//! `OK`/`ERR`, then optionally push frames to other connections. Handlers
//! never panic on an expected store error; only the wire-level translation
//! lives here, not the business logic itself.

use crate::protocol::codec::{build_payload, format_err, format_ok, format_push, Request};
use crate::server::context::AppContext;
use crate::store::account::AccountError;
use crate::store::friendship::FriendshipError;
use crate::store::gm::GmError;
use crate::store::group::GroupError;
use crate::store::pm::{HistoryEntry as PmHistoryEntry, PmError};
use crate::store::session::{ConnectionHandle, ConnectionId, SessionError};

/// Dispatches one parsed request. Returns the full response line(s) to
/// write back to the originating connection, plus whether the worker
/// should terminate the connection after sending it (`DISCONNECT`).
pub async fn dispatch(
    req: &Request,
    conn_id: ConnectionId,
    self_handle: &ConnectionHandle,
    ctx: &AppContext,
) -> (String, bool) {
    tracing::debug!(conn_id, verb = %req.verb, req_id = %req.req_id, "dispatching verb");
    let response = match req.verb.as_str() {
        "PING" => format_ok(&req.req_id, "pong=1"),
        "REGISTER" => handle_register(req, ctx),
        "LOGIN" => handle_login(req, conn_id, ctx).await,
        "LOGOUT" => handle_logout(req, ctx).await,
        "WHOAMI" => handle_whoami(req, ctx).await,
        "DISCONNECT" => {
            return (handle_disconnect(req, ctx).await, true);
        }
        "FRIEND_INVITE" => handle_friend_invite(req, ctx).await,
        "FRIEND_ACCEPT" => handle_friend_accept(req, ctx).await,
        "FRIEND_REJECT" => handle_friend_reject(req, ctx).await,
        "FRIEND_PENDING" => handle_friend_pending(req, ctx).await,
        "FRIEND_LIST" => handle_friend_list(req, ctx).await,
        "FRIEND_DELETE" => handle_friend_delete(req, ctx).await,
        "GROUP_CREATE" => handle_group_create(req, ctx).await,
        "GROUP_LIST" => handle_group_list(req, ctx).await,
        "GROUP_MEMBERS" => handle_group_members(req, ctx).await,
        "GROUP_ADD" => handle_group_add(req, ctx).await,
        "GROUP_REMOVE" => handle_group_remove(req, ctx).await,
        "GROUP_LEAVE" => handle_group_leave(req, ctx).await,
        "PM_CHAT_START" => handle_pm_chat_start(req, ctx).await,
        "PM_CHAT_END" => handle_pm_chat_end(req, ctx).await,
        "PM_SEND" => handle_pm_send(req, ctx).await,
        "PM_HISTORY" => handle_pm_history(req, ctx).await,
        "PM_CONVERSATIONS" => handle_pm_conversations(req, ctx).await,
        "GM_CHAT_START" => handle_gm_chat_start(req, ctx).await,
        "GM_CHAT_END" => handle_gm_chat_end(req, ctx).await,
        "GM_SEND" => handle_gm_send(req, ctx).await,
        "GM_HISTORY" => handle_gm_history(req, ctx).await,
        _ => format_err(&req.req_id, 404, "unknown_command"),
    };
    (response, false)
}

fn missing_fields(req: &Request) -> String {
    format_err(&req.req_id, 400, "missing_fields")
}

fn invalid_token(req: &Request) -> String {
    format_err(&req.req_id, 401, "invalid_token")
}

fn now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Validates `token` and returns the caller's `(user_id, username)`, or the
/// `401 invalid_token` response to hand straight back.
async fn authenticate(req: &Request, ctx: &AppContext) -> Result<(u64, String), String> {
    let token = req.get("token").ok_or_else(|| missing_fields(req))?;
    let user_id = ctx
        .sessions
        .validate(token)
        .await
        .map_err(|_| invalid_token(req))?;
    let username = ctx
        .accounts
        .get_username(user_id)
        .ok_or_else(|| invalid_token(req))?;
    Ok((user_id, username))
}

fn format_pm_history(entries: &[PmHistoryEntry]) -> String {
    if entries.is_empty() {
        return "empty".to_owned();
    }
    entries
        .iter()
        .map(|e| format!("{}:{}:{}:{}", e.msg_id, e.from_username, e.payload, e.ts))
        .collect::<Vec<_>>()
        .join(",")
}

fn format_gm_history(entries: &[crate::store::gm::HistoryEntry]) -> String {
    if entries.is_empty() {
        return "empty".to_owned();
    }
    entries
        .iter()
        .map(|e| format!("{}:{}:{}:{}", e.msg_id, e.from_username, e.payload, e.ts))
        .collect::<Vec<_>>()
        .join(",")
}

/// Best-effort push to `user_id`'s connection, if any. A write error or a
/// stale/absent handle never propagates back to the caller's own request.
async fn push(ctx: &AppContext, user_id: u64, subject: &str, payload: &str) {
    use tokio::io::AsyncWriteExt;
    let Some(handle) = ctx.sessions.get_connection(user_id).await else {
        return;
    };
    let line = format_push(subject, payload);
    let mut guard = handle.lock().await;
    if let Err(e) = guard.write_all(line.as_bytes()).await {
        tracing::debug!(user_id, error = %e, "push delivery failed, dropping silently");
    }
}

fn parse_group_id(req: &Request) -> Result<u64, String> {
    req.get("group_id")
        .and_then(|s| s.parse::<u64>().ok())
        .ok_or_else(|| format_err(&req.req_id, 400, "invalid_group_id"))
}

/// A message payload must not contain `|`: it would corrupt the on-disk
/// record separator for every conversation-log store. A raw space or
/// newline can never reach here — the wire grammar already stops a
/// `key=value` token at the next space, and the line framer strips `\r\n`.
fn validate_content(req: &Request, content: &str) -> Result<(), String> {
    if content.contains('|') {
        return Err(format_err(&req.req_id, 422, "invalid_fields"));
    }
    Ok(())
}

// ---------------------------------------------------------------------
// Account / session
// ---------------------------------------------------------------------

fn handle_register(req: &Request, ctx: &AppContext) -> String {
    let (Some(username), Some(password), Some(email)) =
        (req.get("username"), req.get("password"), req.get("email"))
    else {
        return missing_fields(req);
    };
    match ctx.accounts.register(username, password, email) {
        Ok(id) => {
            ctx.activity_log.record(&format!("user {username} registered as id {id}"));
            format_ok(&req.req_id, &build_payload(&[("user_id", &id.to_string())]))
        }
        Err(AccountError::Exists) => format_err(&req.req_id, 409, "username_exists"),
        Err(AccountError::Invalid(_)) => format_err(&req.req_id, 422, "invalid_fields"),
        Err(AccountError::Io(_)) => format_err(&req.req_id, 500, "server_error"),
        Err(_) => format_err(&req.req_id, 500, "server_error"),
    }
}

async fn handle_login(req: &Request, conn_id: ConnectionId, ctx: &AppContext) -> String {
    let (Some(username), Some(password)) = (req.get("username"), req.get("password")) else {
        return missing_fields(req);
    };
    let user_id = match ctx.accounts.authenticate(username, password) {
        Ok(id) => id,
        Err(AccountError::NotFound)
        | Err(AccountError::BadPassword)
        | Err(AccountError::Inactive) => {
            return format_err(&req.req_id, 401, "invalid_credentials")
        }
        Err(_) => return format_err(&req.req_id, 500, "server_error"),
    };
    match ctx.sessions.create(user_id, conn_id).await {
        Ok(token) => {
            ctx.activity_log.record(&format!("user {username} logged in"));
            format_ok(
                &req.req_id,
                &build_payload(&[("token", &token), ("user_id", &user_id.to_string())]),
            )
        }
        Err(SessionError::AlreadyLoggedIn) => format_err(&req.req_id, 409, "already_logged_in"),
        Err(_) => format_err(&req.req_id, 500, "server_error"),
    }
}

async fn handle_logout(req: &Request, ctx: &AppContext) -> String {
    let Some(token) = req.get("token") else {
        return missing_fields(req);
    };
    match ctx.sessions.destroy(token).await {
        Ok(()) => format_ok(&req.req_id, "ok=1"),
        Err(_) => invalid_token(req),
    }
}

async fn handle_whoami(req: &Request, ctx: &AppContext) -> String {
    match authenticate(req, ctx).await {
        Ok((user_id, _)) => format_ok(&req.req_id, &build_payload(&[("user_id", &user_id.to_string())])),
        Err(e) => e,
    }
}

async fn handle_disconnect(req: &Request, ctx: &AppContext) -> String {
    if let Some(token) = req.get("token") {
        let _ = ctx.sessions.destroy(token).await;
    }
    format_ok(&req.req_id, "ok=1")
}

// ---------------------------------------------------------------------
// Friendships
// ---------------------------------------------------------------------

async fn handle_friend_invite(req: &Request, ctx: &AppContext) -> String {
    let Some(target) = req.get("username") else {
        return missing_fields(req);
    };
    let (_, username) = match authenticate(req, ctx).await {
        Ok(v) => v,
        Err(e) => return e,
    };
    match ctx.friendships.invite(&ctx.accounts, &username, target) {
        Ok(()) => format_ok(
            &req.req_id,
            &build_payload(&[("username", target), ("status", "pending")]),
        ),
        Err(FriendshipError::SelfEdge) => format_err(&req.req_id, 422, "cannot_invite_self"),
        Err(FriendshipError::NotFound) => format_err(&req.req_id, 404, "user_not_found"),
        Err(FriendshipError::Exists) => format_err(&req.req_id, 409, "already_friend_or_pending"),
        Err(FriendshipError::Io(_)) => format_err(&req.req_id, 500, "server_error"),
    }
}

async fn handle_friend_accept(req: &Request, ctx: &AppContext) -> String {
    let Some(target) = req.get("username") else {
        return missing_fields(req);
    };
    let (_, username) = match authenticate(req, ctx).await {
        Ok(v) => v,
        Err(e) => return e,
    };
    if target == username {
        return format_err(&req.req_id, 422, "cannot_accept_self");
    }
    match ctx.friendships.accept(&username, target) {
        Ok(()) => format_ok(
            &req.req_id,
            &build_payload(&[("username", target), ("status", "accepted")]),
        ),
        Err(FriendshipError::NotFound) => format_err(&req.req_id, 404, "invite_not_found"),
        Err(_) => format_err(&req.req_id, 500, "server_error"),
    }
}

async fn handle_friend_reject(req: &Request, ctx: &AppContext) -> String {
    let Some(target) = req.get("username") else {
        return missing_fields(req);
    };
    let (_, username) = match authenticate(req, ctx).await {
        Ok(v) => v,
        Err(e) => return e,
    };
    if target == username {
        return format_err(&req.req_id, 422, "cannot_reject_self");
    }
    match ctx.friendships.reject(&username, target) {
        Ok(()) => format_ok(
            &req.req_id,
            &build_payload(&[("username", target), ("status", "rejected")]),
        ),
        Err(FriendshipError::NotFound) => format_err(&req.req_id, 404, "invite_not_found"),
        Err(_) => format_err(&req.req_id, 500, "server_error"),
    }
}

async fn handle_friend_pending(req: &Request, ctx: &AppContext) -> String {
    let (_, username) = match authenticate(req, ctx).await {
        Ok(v) => v,
        Err(e) => return e,
    };
    match ctx.friendships.pending(&username) {
        Ok(names) => format_ok(&req.req_id, &build_payload(&[("username", &names.join(","))])),
        Err(_) => format_err(&req.req_id, 500, "server_error"),
    }
}

async fn handle_friend_list(req: &Request, ctx: &AppContext) -> String {
    let (_, username) = match authenticate(req, ctx).await {
        Ok(v) => v,
        Err(e) => return e,
    };
    match ctx.friendships.list(&ctx.sessions, &ctx.accounts, &username).await {
        Ok(entries) => format_ok(&req.req_id, &build_payload(&[("username", &entries.join(","))])),
        Err(_) => format_err(&req.req_id, 500, "server_error"),
    }
}

async fn handle_friend_delete(req: &Request, ctx: &AppContext) -> String {
    let Some(target) = req.get("username") else {
        return missing_fields(req);
    };
    let (_, username) = match authenticate(req, ctx).await {
        Ok(v) => v,
        Err(e) => return e,
    };
    if target == username {
        return format_err(&req.req_id, 422, "cannot_delete_self");
    }
    match ctx.friendships.delete(&username, target) {
        Ok(()) => format_ok(
            &req.req_id,
            &build_payload(&[("username", target), ("status", "deleted")]),
        ),
        Err(FriendshipError::NotFound) => format_err(&req.req_id, 404, "friend_not_found"),
        Err(_) => format_err(&req.req_id, 500, "server_error"),
    }
}

// ---------------------------------------------------------------------
// Groups
// ---------------------------------------------------------------------

async fn handle_group_create(req: &Request, ctx: &AppContext) -> String {
    let Some(name) = req.get("name") else {
        return missing_fields(req);
    };
    let (_, username) = match authenticate(req, ctx).await {
        Ok(v) => v,
        Err(e) => return e,
    };
    match ctx.groups.create(&username, name) {
        Ok(id) => format_ok(
            &req.req_id,
            &build_payload(&[("group_id", &id.to_string()), ("name", name)]),
        ),
        Err(_) => format_err(&req.req_id, 500, "server_error"),
    }
}

async fn handle_group_list(req: &Request, ctx: &AppContext) -> String {
    let (_, username) = match authenticate(req, ctx).await {
        Ok(v) => v,
        Err(e) => return e,
    };
    match ctx.groups.list(&username) {
        Ok(ids) => {
            let joined = ids.iter().map(|g| g.to_string()).collect::<Vec<_>>().join(",");
            format_ok(&req.req_id, &build_payload(&[("groups", &joined)]))
        }
        Err(_) => format_err(&req.req_id, 500, "server_error"),
    }
}

async fn handle_group_members(req: &Request, ctx: &AppContext) -> String {
    let group_id = match parse_group_id(req) {
        Ok(g) => g,
        Err(e) => return e,
    };
    let (_, username) = match authenticate(req, ctx).await {
        Ok(v) => v,
        Err(e) => return e,
    };
    match ctx.groups.list_members(&username, group_id) {
        Ok(members) => format_ok(&req.req_id, &build_payload(&[("members", &members.join(","))])),
        Err(GroupError::GroupNotFound) => format_err(&req.req_id, 400, "invalid_group_id"),
        Err(GroupError::Permission) => format_err(&req.req_id, 403, "not_group_member"),
        Err(_) => format_err(&req.req_id, 500, "server_error"),
    }
}

async fn handle_group_add(req: &Request, ctx: &AppContext) -> String {
    let group_id = match parse_group_id(req) {
        Ok(g) => g,
        Err(e) => return e,
    };
    let Some(target) = req.get("username") else {
        return missing_fields(req);
    };
    let (_, username) = match authenticate(req, ctx).await {
        Ok(v) => v,
        Err(e) => return e,
    };
    match ctx.groups.add_member(&ctx.accounts, &username, group_id, target) {
        Ok(()) => {
            notify_group_join(ctx, group_id, target).await;
            format_ok(
                &req.req_id,
                &build_payload(&[
                    ("group_id", &group_id.to_string()),
                    ("username", target),
                    ("status", "added"),
                ]),
            )
        }
        Err(GroupError::GroupNotFound) => format_err(&req.req_id, 404, "group_not_found"),
        Err(GroupError::Permission) => format_err(&req.req_id, 403, "not_group_owner"),
        Err(GroupError::NotFound) => format_err(&req.req_id, 404, "user_not_found"),
        Err(GroupError::Exists) => format_err(&req.req_id, 409, "already_member"),
        Err(_) => format_err(&req.req_id, 500, "server_error"),
    }
}

/// After a successful `GROUP_ADD`, tells every other member currently in
/// that group's chat mode that `added_username` joined.
async fn notify_group_join(ctx: &AppContext, group_id: u64, added_username: &str) {
    let Ok(members) = ctx.groups.list_members(added_username, group_id) else {
        return;
    };
    let payload = build_payload(&[("user", added_username), ("group_id", &group_id.to_string())]);
    for member in members.iter().filter(|m| m.as_str() != added_username) {
        if let Some(member_id) = ctx.accounts.get_user_id(member) {
            if ctx.sessions.is_in_group_chat(member_id, group_id).await {
                push(ctx, member_id, "GM_JOIN", &payload).await;
            }
        }
    }
}

async fn handle_group_remove(req: &Request, ctx: &AppContext) -> String {
    let group_id = match parse_group_id(req) {
        Ok(g) => g,
        Err(e) => return e,
    };
    let Some(target) = req.get("username") else {
        return missing_fields(req);
    };
    let (_, username) = match authenticate(req, ctx).await {
        Ok(v) => v,
        Err(e) => return e,
    };
    // Members currently in this group's chat mode, captured *before* the
    // removal so the departing member is still reachable here.
    let members_before = ctx.groups.list_members(&username, group_id).unwrap_or_default();
    match ctx.groups.remove_member(&username, group_id, target) {
        Ok(()) => {
            notify_group_leave(ctx, group_id, target, &members_before).await;
            if let Some(target_id) = ctx.accounts.get_user_id(target) {
                if ctx.sessions.is_in_group_chat(target_id, group_id).await {
                    let payload = build_payload(&[("group_id", &group_id.to_string())]);
                    push(ctx, target_id, "GM_KICKED", &payload).await;
                    ctx.sessions.set_chat_group(target_id, 0).await;
                }
            }
            format_ok(
                &req.req_id,
                &build_payload(&[
                    ("group_id", &group_id.to_string()),
                    ("username", target),
                    ("status", "removed"),
                ]),
            )
        }
        Err(GroupError::GroupNotFound) => format_err(&req.req_id, 404, "group_not_found"),
        Err(GroupError::Permission) => format_err(&req.req_id, 403, "not_group_owner"),
        Err(GroupError::NotFound) => format_err(&req.req_id, 404, "member_not_found"),
        Err(_) => format_err(&req.req_id, 500, "server_error"),
    }
}

async fn handle_group_leave(req: &Request, ctx: &AppContext) -> String {
    let group_id = match parse_group_id(req) {
        Ok(g) => g,
        Err(e) => return e,
    };
    let (user_id, username) = match authenticate(req, ctx).await {
        Ok(v) => v,
        Err(e) => return e,
    };
    let members_before = ctx.groups.list_members(&username, group_id).unwrap_or_default();
    match ctx.groups.leave(&username, group_id) {
        Ok(()) => {
            notify_group_leave(ctx, group_id, &username, &members_before).await;
            if ctx.sessions.get_chat_group(user_id).await == group_id {
                ctx.sessions.set_chat_group(user_id, 0).await;
            }
            format_ok(
                &req.req_id,
                &build_payload(&[("group_id", &group_id.to_string()), ("status", "left")]),
            )
        }
        Err(GroupError::GroupNotFound) => format_err(&req.req_id, 404, "group_not_found"),
        Err(GroupError::SelfLeave) => format_err(&req.req_id, 422, "owner_cannot_leave"),
        Err(GroupError::NotFound) => format_err(&req.req_id, 404, "member_not_found"),
        Err(_) => format_err(&req.req_id, 500, "server_error"),
    }
}

/// Tells every group-chat-mode member other than `departed_username` that
/// they left (used by both `GROUP_REMOVE` and `GROUP_LEAVE`).
async fn notify_group_leave(
    ctx: &AppContext,
    group_id: u64,
    departed_username: &str,
    members_before: &[String],
) {
    let payload = build_payload(&[("user", departed_username), ("group_id", &group_id.to_string())]);
    for member in members_before.iter().filter(|m| m.as_str() != departed_username) {
        if let Some(member_id) = ctx.accounts.get_user_id(member) {
            if ctx.sessions.is_in_group_chat(member_id, group_id).await {
                push(ctx, member_id, "GM_LEAVE", &payload).await;
            }
        }
    }
}

// ---------------------------------------------------------------------
// Private messages
// ---------------------------------------------------------------------

async fn handle_pm_chat_start(req: &Request, ctx: &AppContext) -> String {
    let Some(with) = req.get("with") else {
        return missing_fields(req);
    };
    let (user_id, username) = match authenticate(req, ctx).await {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(with_id) = ctx.accounts.get_user_id(with) else {
        return format_err(&req.req_id, 404, "user_not_found");
    };
    ctx.sessions.set_chat_partner(user_id, with_id).await;
    let _ = ctx.pm.mark_read(&ctx.accounts, user_id, with);
    match ctx.pm.history(&ctx.accounts, user_id, with, None) {
        Ok(entries) => format_ok(
            &req.req_id,
            &build_payload(&[
                ("with", with),
                ("me", &username),
                ("history", &format_pm_history(&entries)),
            ]),
        ),
        Err(_) => format_err(&req.req_id, 500, "server_error"),
    }
}

async fn handle_pm_chat_end(req: &Request, ctx: &AppContext) -> String {
    let (user_id, _) = match authenticate(req, ctx).await {
        Ok(v) => v,
        Err(e) => return e,
    };
    let partner_id = ctx.sessions.get_chat_partner(user_id).await;
    if partner_id != 0 {
        if let Some(partner_username) = ctx.accounts.get_username(partner_id) {
            let _ = ctx.pm.mark_read(&ctx.accounts, user_id, &partner_username);
        }
        ctx.sessions.set_chat_partner(user_id, 0).await;
    }
    format_ok(&req.req_id, "status=chat_ended")
}

async fn handle_pm_send(req: &Request, ctx: &AppContext) -> String {
    let (Some(to), Some(content)) = (req.get("to"), req.get("content")) else {
        return missing_fields(req);
    };
    let (user_id, username) = match authenticate(req, ctx).await {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = validate_content(req, content) {
        return e;
    }
    match ctx.pm.send(&ctx.accounts, user_id, to, content) {
        Ok(msg_id) => {
            if let Some(to_id) = ctx.accounts.get_user_id(to) {
                if ctx.sessions.is_chatting_with(to_id, user_id).await {
                    let payload = build_payload(&[
                        ("from", &username),
                        ("content", content),
                        ("msg_id", &msg_id.to_string()),
                        ("ts", &now().to_string()),
                    ]);
                    push(ctx, to_id, "PM", &payload).await;
                }
            }
            format_ok(
                &req.req_id,
                &build_payload(&[
                    ("msg_id", &msg_id.to_string()),
                    ("to", to),
                    ("status", "sent"),
                ]),
            )
        }
        Err(PmError::SelfMessage) => format_err(&req.req_id, 422, "cannot_send_to_self"),
        Err(PmError::NotFound) => format_err(&req.req_id, 404, "user_not_found"),
        Err(PmError::Io(_)) => format_err(&req.req_id, 500, "server_error"),
    }
}

async fn handle_pm_history(req: &Request, ctx: &AppContext) -> String {
    let Some(with) = req.get("with") else {
        return missing_fields(req);
    };
    let (user_id, _) = match authenticate(req, ctx).await {
        Ok(v) => v,
        Err(e) => return e,
    };
    let limit = req.get("limit").and_then(|s| s.parse::<usize>().ok());
    match ctx.pm.history(&ctx.accounts, user_id, with, limit) {
        Ok(entries) => format_ok(
            &req.req_id,
            &build_payload(&[("with", with), ("messages", &format_pm_history(&entries))]),
        ),
        Err(PmError::NotFound) => format_err(&req.req_id, 404, "user_not_found"),
        Err(_) => format_err(&req.req_id, 500, "server_error"),
    }
}

async fn handle_pm_conversations(req: &Request, ctx: &AppContext) -> String {
    let (user_id, _) = match authenticate(req, ctx).await {
        Ok(v) => v,
        Err(e) => return e,
    };
    match ctx.pm.conversations(&ctx.accounts, user_id) {
        Ok(entries) => {
            let joined = entries
                .iter()
                .map(|(u, n)| format!("{u}:{n}"))
                .collect::<Vec<_>>()
                .join(",");
            format_ok(&req.req_id, &build_payload(&[("conversations", &joined)]))
        }
        Err(_) => format_err(&req.req_id, 500, "server_error"),
    }
}

// ---------------------------------------------------------------------
// Group messages
// ---------------------------------------------------------------------

async fn handle_gm_chat_start(req: &Request, ctx: &AppContext) -> String {
    let group_id = match parse_group_id(req) {
        Ok(g) => g,
        Err(e) => return e,
    };
    let (user_id, username) = match authenticate(req, ctx).await {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = ctx.groups.list_members(&username, group_id) {
        return match e {
            GroupError::GroupNotFound => format_err(&req.req_id, 404, "group_not_found"),
            GroupError::Permission => format_err(&req.req_id, 403, "not_group_member"),
            _ => format_err(&req.req_id, 500, "server_error"),
        };
    }
    let group_name = match ctx.groups.group_name(group_id) {
        Ok(name) => name,
        Err(_) => return format_err(&req.req_id, 404, "group_not_found"),
    };
    ctx.sessions.set_chat_group(user_id, group_id).await;
    match ctx.gm.history(&ctx.groups, &username, group_id, None) {
        Ok(entries) => format_ok(
            &req.req_id,
            &build_payload(&[
                ("group_id", &group_id.to_string()),
                ("group_name", &group_name),
                ("me", &username),
                ("history", &format_gm_history(&entries)),
            ]),
        ),
        Err(_) => format_err(&req.req_id, 500, "server_error"),
    }
}

async fn handle_gm_chat_end(req: &Request, ctx: &AppContext) -> String {
    let (user_id, _) = match authenticate(req, ctx).await {
        Ok(v) => v,
        Err(e) => return e,
    };
    ctx.sessions.set_chat_group(user_id, 0).await;
    format_ok(&req.req_id, "status=chat_ended")
}

async fn handle_gm_send(req: &Request, ctx: &AppContext) -> String {
    let group_id = match parse_group_id(req) {
        Ok(g) => g,
        Err(e) => return e,
    };
    let Some(content) = req.get("content") else {
        return missing_fields(req);
    };
    let (_, username) = match authenticate(req, ctx).await {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = validate_content(req, content) {
        return e;
    }
    match ctx.gm.send(&ctx.groups, &username, group_id, content) {
        Ok(msg_id) => {
            fanout_group_message(ctx, group_id, &username, content, msg_id).await;
            format_ok(
                &req.req_id,
                &build_payload(&[("msg_id", &msg_id.to_string()), ("status", "sent")]),
            )
        }
        Err(GmError::Group(GroupError::GroupNotFound)) => {
            format_err(&req.req_id, 404, "group_not_found")
        }
        Err(GmError::Group(GroupError::Permission)) => {
            format_err(&req.req_id, 403, "not_group_member")
        }
        Err(_) => format_err(&req.req_id, 500, "server_error"),
    }
}

/// Pushes a `GM` frame to every member besides the sender who currently has
/// this group in chat mode.
async fn fanout_group_message(
    ctx: &AppContext,
    group_id: u64,
    sender_username: &str,
    content: &str,
    msg_id: u64,
) {
    let Ok(members) = ctx.groups.list_members(sender_username, group_id) else {
        return;
    };
    let payload = build_payload(&[
        ("from", sender_username),
        ("group_id", &group_id.to_string()),
        ("content", content),
        ("msg_id", &msg_id.to_string()),
        ("ts", &now().to_string()),
    ]);
    for member in members.iter().filter(|m| m.as_str() != sender_username) {
        if let Some(member_id) = ctx.accounts.get_user_id(member) {
            if ctx.sessions.is_in_group_chat(member_id, group_id).await {
                push(ctx, member_id, "GM", &payload).await;
            }
        }
    }
}

async fn handle_gm_history(req: &Request, ctx: &AppContext) -> String {
    let group_id = match parse_group_id(req) {
        Ok(g) => g,
        Err(e) => return e,
    };
    let (_, username) = match authenticate(req, ctx).await {
        Ok(v) => v,
        Err(e) => return e,
    };
    let limit = req.get("limit").and_then(|s| s.parse::<usize>().ok());
    match ctx.gm.history(&ctx.groups, &username, group_id, limit) {
        Ok(entries) => format_ok(
            &req.req_id,
            &build_payload(&[
                ("group_id", &group_id.to_string()),
                ("messages", &format_gm_history(&entries)),
            ]),
        ),
        Err(GmError::Group(GroupError::GroupNotFound)) => {
            format_err(&req.req_id, 404, "group_not_found")
        }
        Err(GmError::Group(GroupError::Permission)) => {
            format_err(&req.req_id, 403, "not_group_member")
        }
        Err(_) => format_err(&req.req_id, 500, "server_error"),
    }
}
