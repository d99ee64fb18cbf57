//! Voice signaling router.
//!
//! Stateless pass-through: offers, answers and ICE candidates are unicast to
//! the peer named in `to`, speaking state is broadcast. Payloads are never
//! inspected.

use crate::protocol::{
    ServerMsg, VoiceAnswerMsg, VoiceAnswerRequest, VoiceIceCandidateMsg,
    VoiceIceCandidateRequest, VoiceOfferMsg, VoiceOfferRequest, VoiceSpeakingMsg,
    VoiceSpeakingRequest,
};
use crate::session::SessionRegistry;

pub fn relay_offer(sessions: &SessionRegistry, from: &str, req: VoiceOfferRequest) -> bool {
    let msg = ServerMsg::VoiceOffer(VoiceOfferMsg {
        from: from.to_string(),
        offer: req.offer,
    });
    unicast(sessions, from, &req.to, msg)
}

pub fn relay_answer(sessions: &SessionRegistry, from: &str, req: VoiceAnswerRequest) -> bool {
    let msg = ServerMsg::VoiceAnswer(VoiceAnswerMsg {
        from: from.to_string(),
        answer: req.answer,
    });
    unicast(sessions, from, &req.to, msg)
}

pub fn relay_ice_candidate(
    sessions: &SessionRegistry,
    from: &str,
    req: VoiceIceCandidateRequest,
) -> bool {
    let msg = ServerMsg::VoiceIceCandidate(VoiceIceCandidateMsg {
        from: from.to_string(),
        candidate: req.candidate,
    });
    unicast(sessions, from, &req.to, msg)
}

/// Broadcast speaking state to everyone but the speaker, tagged with the
/// speaker's own id.
pub fn relay_speaking(sessions: &SessionRegistry, from: &str, req: VoiceSpeakingRequest) -> usize {
    let msg = ServerMsg::VoiceSpeaking(VoiceSpeakingMsg {
        player_id: from.to_string(),
        is_speaking: req.is_speaking,
    });
    sessions.broadcast_except(from, &msg)
}

/// Signals addressed to oneself or to an unknown peer are dropped.
fn unicast(sessions: &SessionRegistry, from: &str, to: &str, msg: ServerMsg) -> bool {
    if to == from {
        return false;
    }
    let delivered = sessions.send_to(to, msg);
    if !delivered {
        tracing::debug!(from = %from, to = %to, "Dropped voice signal for unknown peer");
    }
    delivered
}
