//! Output settings. Anything the engine cannot take yet is kept in
//! [`PendingConfig`](crate::context::PendingConfig) and retried on load and on state changes.

use media_bridge_types::Rectangle;

use super::engine_of;
use crate::context::SessionContext;
use crate::engine::{EngineError, MediaEngine};
use crate::error::SessionError;

type Apply<T> = fn(&mut dyn MediaEngine, T) -> Result<(), EngineError>;

fn apply_or_defer<T: Copy>(
    engine: Option<&mut Box<dyn MediaEngine>>,
    slot: &mut Option<T>,
    value: T,
    apply: Apply<T>,
) -> Result<(), SessionError> {
    let Some(engine) = engine else {
        *slot = Some(value);
        return Ok(());
    };
    match apply(&mut **engine, value) {
        Ok(()) => {
            *slot = None;
            Ok(())
        }
        Err(EngineError::NotReady) => {
            *slot = Some(value);
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Retry every deferred setting the engine may now accept.
pub fn apply_pending(ctx: &mut SessionContext) {
    if ctx.engine.is_none() || ctx.pending.is_empty() {
        return;
    }
    let pending = ctx.pending;
    let engine = &mut ctx.engine;
    let slots = &mut ctx.pending;
    let results = [
        pending
            .geometry
            .map(|v| apply_or_defer(engine.as_mut(), &mut slots.geometry, v, |e, v| e.set_video_geometry(v))),
        pending
            .volume
            .map(|v| apply_or_defer(engine.as_mut(), &mut slots.volume, v, |e, v| e.set_volume(v))),
        pending
            .mute
            .map(|v| apply_or_defer(engine.as_mut(), &mut slots.mute, v, |e, v| e.set_mute(v))),
        pending
            .sync
            .map(|v| apply_or_defer(engine.as_mut(), &mut slots.sync, v, |e, v| e.set_sync(v))),
        pending.buffering_limit.map(|v| {
            apply_or_defer(engine.as_mut(), &mut slots.buffering_limit, v, |e, v| {
                e.set_buffering_limit(v)
            })
        }),
    ];
    for result in results.into_iter().flatten() {
        if let Err(e) = result {
            tracing::warn!(session_id = %ctx.session_id, "failed to apply deferred setting: {e}");
        }
    }
}

pub struct SetVideoGeometry {
    pub window: Rectangle,
}

impl SetVideoGeometry {
    pub fn execute(self, ctx: &mut SessionContext) -> Result<(), SessionError> {
        apply_or_defer(ctx.engine.as_mut(), &mut ctx.pending.geometry, self.window, |e, v| {
            e.set_video_geometry(v)
        })
    }
}

pub struct SetVolume {
    pub volume: f64,
}

impl SetVolume {
    pub fn execute(self, ctx: &mut SessionContext) -> Result<(), SessionError> {
        let volume = self.volume.clamp(0.0, 1.0);
        apply_or_defer(ctx.engine.as_mut(), &mut ctx.pending.volume, volume, |e, v| e.set_volume(v))
    }
}

pub struct SetMute {
    pub mute: bool,
}

impl SetMute {
    pub fn execute(self, ctx: &mut SessionContext) -> Result<(), SessionError> {
        apply_or_defer(ctx.engine.as_mut(), &mut ctx.pending.mute, self.mute, |e, v| e.set_mute(v))
    }
}

pub struct SetSync {
    pub sync: bool,
}

impl SetSync {
    pub fn execute(self, ctx: &mut SessionContext) -> Result<(), SessionError> {
        apply_or_defer(ctx.engine.as_mut(), &mut ctx.pending.sync, self.sync, |e, v| e.set_sync(v))
    }
}

pub struct SetBufferingLimit {
    pub limit_ms: u32,
}

impl SetBufferingLimit {
    pub fn execute(self, ctx: &mut SessionContext) -> Result<(), SessionError> {
        apply_or_defer(
            ctx.engine.as_mut(),
            &mut ctx.pending.buffering_limit,
            self.limit_ms,
            |e, v| e.set_buffering_limit(v),
        )
    }
}

pub struct RenderFrame;

impl RenderFrame {
    pub fn execute(self, ctx: &mut SessionContext) -> Result<(), SessionError> {
        engine_of(&mut ctx.engine)?.render_frame()?;
        Ok(())
    }
}
