//! Standard-library natives for the Rill runtime.
//!
//! Everything here talks to the core exclusively through the native-function
//! boundary: arguments arrive from the callee register window, results go
//! back through the return slot, and cooperative control transfer happens
//! via the context's yield/suspend requests.

use anyhow::{Result, bail};
use tracing::trace;

use rill_core::gc::HeapData;
use rill_core::val::{TableKey, Val};
use rill_core::vm::{VmCtx, register_native};

const TRACE_TARGET: &str = "rill::stdlib";

/// Register every stdlib native. Safe to call more than once.
pub fn install() {
    register_native("echo", 1, echo);
    register_native("typeof", 1, type_of);
    register_native("str", 1, to_str);
    register_native("len", 1, len);
    register_native("array_keys", 1, array_keys);
    register_native("clock_ms", 0, clock_ms);
    register_native("sleep_ms", 1, sleep_ms);
    register_native("co_yield", 0, co_yield);
    register_native("co_id", 0, co_id);
    register_native("co_alive", 1, co_alive);
    trace!(target: TRACE_TARGET, "stdlib natives installed");
}

fn echo(args: &[Val], ctx: &mut VmCtx) -> Result<Val> {
    let line = ctx.render(args[0]);
    ctx.echo_line(line);
    Ok(Val::Nil)
}

fn type_of(args: &[Val], ctx: &mut VmCtx) -> Result<Val> {
    ctx.alloc_str(args[0].type_name())
}

fn to_str(args: &[Val], ctx: &mut VmCtx) -> Result<Val> {
    let rendered = ctx.render(args[0]);
    ctx.alloc_str(&rendered)
}

fn len(args: &[Val], ctx: &mut VmCtx) -> Result<Val> {
    match args[0] {
        Val::Str(h) => match ctx.heap().str_content(h) {
            Some(s) => Ok(Val::Int(s.len() as i64)),
            None => bail!("stale string handle"),
        },
        Val::Table(h) => Ok(Val::Int(ctx.heap().table_len(h)?)),
        other => bail!("len expects a string or array, got {}", other.type_name()),
    }
}

/// Keys of an array as a new array: int keys first (ascending), then string
/// keys (sorted), so the result is deterministic.
fn array_keys(args: &[Val], ctx: &mut VmCtx) -> Result<Val> {
    let Val::Table(table) = args[0] else {
        bail!("array_keys expects an array, got {}", args[0].type_name());
    };
    let (mut ints, mut strs) = match ctx.heap().get(table) {
        Some(HeapData::Table(map)) => {
            let mut ints = Vec::new();
            let mut strs = Vec::new();
            for key in map.keys() {
                match key {
                    TableKey::Int(i) => ints.push(*i),
                    TableKey::Str(s) => strs.push(s.to_string()),
                }
            }
            (ints, strs)
        }
        _ => bail!("stale array handle"),
    };
    ints.sort_unstable();
    strs.sort();

    let out = ctx.alloc_table()?;
    let Val::Table(out_handle) = out else { unreachable!() };
    for i in ints {
        ctx.heap_mut().table_add(out_handle, Val::Int(i))?;
    }
    for s in strs {
        let v = ctx.alloc_str(&s)?;
        ctx.heap_mut().table_add(out_handle, v)?;
    }
    Ok(out)
}

fn clock_ms(_args: &[Val], _ctx: &mut VmCtx) -> Result<Val> {
    Ok(Val::Int(chrono::Utc::now().timestamp_millis()))
}

fn sleep_ms(args: &[Val], ctx: &mut VmCtx) -> Result<Val> {
    let ms = match args[0] {
        Val::Int(i) if i >= 0 => i as u64,
        other => bail!("sleep_ms expects a non-negative int, got {}", ctx.render(other)),
    };
    ctx.sleep_wake(ms)?;
    Ok(Val::Nil)
}

fn co_yield(_args: &[Val], ctx: &mut VmCtx) -> Result<Val> {
    ctx.request_yield();
    Ok(Val::Nil)
}

fn co_id(_args: &[Val], ctx: &mut VmCtx) -> Result<Val> {
    Ok(Val::Int(ctx.co_id() as i64))
}

fn co_alive(args: &[Val], ctx: &mut VmCtx) -> Result<Val> {
    Ok(Val::Bool(ctx.co_alive(args[0])?))
}
