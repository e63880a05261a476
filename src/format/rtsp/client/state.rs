use std::fmt;

use crate::format::rtsp::Method;
use crate::{Result, RtspError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Idle,
    Described,
    Prepared,
    Playing,
    Recording,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ClientState::Idle => "idle",
            ClientState::Described => "described",
            ClientState::Prepared => "prepared",
            ClientState::Playing => "playing",
            ClientState::Recording => "recording",
        })
    }
}

/// What the ordering check needs to know about the session.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Snapshot {
    pub state: ClientState,
    pub announced: bool,
    pub medias: usize,
}

impl Snapshot {
    /// Whether `method` may be sent now. Nothing is sent when this fails.
    pub fn check(&self, method: Method) -> Result<()> {
        use ClientState::*;

        let allowed = match method {
            Method::Options | Method::GetParameter | Method::SetParameter => true,
            Method::Describe | Method::Announce => matches!(self.state, Idle | Described),
            Method::Setup => matches!(self.state, Described | Prepared),
            Method::Play => self.state == Prepared && !self.announced && self.medias > 0,
            Method::Record => self.state == Prepared && self.announced && self.medias > 0,
            Method::Pause => matches!(self.state, Playing | Recording),
            Method::Teardown => self.state != Idle,
            Method::Other(_) => self.state != Idle,
        };

        if allowed {
            Ok(())
        } else {
            Err(RtspError::InvalidState {
                method,
                state: self.state.to_string(),
            })
        }
    }
}
