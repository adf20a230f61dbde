use crate::calc;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::snapshot;
use rusqlite::Connection;
use serde_json::json;

fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.to_string())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

fn calc_err(req: &Request, e: calc::CalcError) -> serde_json::Value {
    err(
        &req.id,
        &e.code,
        e.message,
        e.details.map(|d| json!(d)).or(None),
    )
}

fn handle_class_stats(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let classroom_id = match required_str(req, "classroomId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let term_id = match required_str(req, "termId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let pass_mark = req
        .params
        .get("passMark")
        .and_then(|v| v.as_f64())
        .unwrap_or(calc::DEFAULT_PASS_MARK);

    let (ctx, term, class_snapshot) =
        match snapshot::load_class_term_snapshot(conn, &classroom_id, &term_id) {
            Ok(v) => v,
            Err(e) => return calc_err(req, e),
        };
    let stats = calc::class_stats(&class_snapshot, pass_mark);

    ok(
        &req.id,
        json!({
            "classroom": {
                "id": ctx.classroom_id,
                "name": ctx.name,
                "level": ctx.level_code,
                "year": ctx.year_name,
                "policy": ctx.policy.as_str(),
            },
            "term": { "id": term.term_id, "index": term.index },
            "passMark": pass_mark,
            "stats": stats,
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "analytics.classStats" => Some(handle_class_stats(state, req)),
        _ => None,
    }
}
