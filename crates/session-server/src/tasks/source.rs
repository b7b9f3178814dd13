//! Source attachment.

use media_bridge_types::{MediaSource, SourceId};

use super::engine_of;
use crate::context::{SessionContext, StreamState};
use crate::error::SessionError;

/// Attach a source; one stream per source type.
pub struct AttachSource {
    pub source: MediaSource,
}

impl AttachSource {
    pub fn execute(self, ctx: &mut SessionContext) -> Result<SourceId, SessionError> {
        let source_type = self.source.source_type();
        if ctx.all_sources_attached {
            return Err(SessionError::AllSourcesAlreadyAttached);
        }
        if ctx.streams.contains_key(&source_type) {
            return Err(SessionError::SourceAlreadyAttached(source_type));
        }
        engine_of(&mut ctx.engine)?.attach_source(&self.source)?;

        let source_id = ctx.generate_source_id();
        tracing::info!(
            session_id = %ctx.session_id,
            source_id = %source_id,
            source_type = %source_type,
            mime_type = %self.source.mime_type(),
            "source attached"
        );
        ctx.streams
            .insert(source_type, StreamState::new(source_id, self.source));
        Ok(source_id)
    }
}

pub struct RemoveSource {
    pub source_id: SourceId,
}

impl RemoveSource {
    pub fn execute(self, ctx: &mut SessionContext) -> Result<(), SessionError> {
        let (source_type, _) = ctx
            .stream_by_id(self.source_id)
            .ok_or(SessionError::UnknownSource(self.source_id))?;
        engine_of(&mut ctx.engine)?.remove_source(source_type)?;
        ctx.streams.remove(&source_type);
        ctx.retire_requests(source_type);
        tracing::info!(session_id = %ctx.session_id, source_id = %self.source_id, "source removed");
        Ok(())
    }
}

/// No more sources will follow; may be sent once per load.
pub struct AllSourcesAttached;

impl AllSourcesAttached {
    pub fn execute(self, ctx: &mut SessionContext) -> Result<(), SessionError> {
        if ctx.all_sources_attached {
            return Err(SessionError::AllSourcesAlreadyAttached);
        }
        engine_of(&mut ctx.engine)?.all_sources_attached()?;
        ctx.all_sources_attached = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::testing::{EngineCall, Harness};
    use media_bridge_types::{AudioConfig, MediaSourceType};

    fn audio() -> MediaSource {
        MediaSource::Audio(AudioConfig {
            mime_type: "audio/aac".to_string(),
            sample_rate: 44_100,
            channels: 2,
            codec_data: None,
        })
    }

    #[test]
    fn attach_requires_load() {
        let mut h = Harness::new();
        assert!(matches!(
            AttachSource { source: audio() }.execute(&mut h.ctx),
            Err(SessionError::NotLoaded)
        ));
    }

    #[test]
    fn second_source_of_same_type_is_rejected() {
        let mut h = Harness::loaded();
        assert!(matches!(
            AttachSource { source: audio() }.execute(&mut h.ctx),
            Err(SessionError::SourceAlreadyAttached(MediaSourceType::Audio))
        ));
        assert_eq!(h.ctx.streams.len(), 2);
    }

    #[test]
    fn source_ids_are_unique_and_not_reused() {
        let mut h = Harness::loaded();
        let old = h.source_id(MediaSourceType::Audio);
        RemoveSource { source_id: old }.execute(&mut h.ctx).unwrap();
        assert!(h.recorder.calls().contains(&EngineCall::RemoveSource(MediaSourceType::Audio)));

        let new = AttachSource { source: audio() }.execute(&mut h.ctx).unwrap();
        assert_ne!(new, old);
        assert_ne!(new, h.source_id(MediaSourceType::Video));
    }

    #[test]
    fn remove_unknown_source_fails() {
        let mut h = Harness::loaded();
        assert!(matches!(
            RemoveSource {
                source_id: SourceId(77)
            }
            .execute(&mut h.ctx),
            Err(SessionError::UnknownSource(SourceId(77)))
        ));
    }

    #[test]
    fn all_sources_attached_only_once() {
        let mut h = Harness::loaded();
        AllSourcesAttached.execute(&mut h.ctx).unwrap();
        assert!(matches!(
            AllSourcesAttached.execute(&mut h.ctx),
            Err(SessionError::AllSourcesAlreadyAttached)
        ));
        assert!(matches!(
            AttachSource { source: audio() }.execute(&mut h.ctx),
            Err(SessionError::AllSourcesAlreadyAttached)
        ));
    }
}
