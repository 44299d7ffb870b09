//! Server-side reclamation of sessions whose borrowers went quiet.

use crate::wrapper::SessionWrapper;

/// Outcome of probing one pooled session's backend state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The backend reported idle; the session was released back to the
    /// pool.
    Reclaimed,
    /// The backend is doing work; the session was left untouched.
    Busy,
    /// The backend is gone or stateless; the session was closed.
    Gone,
    /// The probe itself failed; nothing was changed and the session will
    /// be probed again on the next pass.
    Skipped,
}

/// Probe `target`'s backend through the dedicated `prober` session.
///
/// A backend sitting idle means the borrower finished without releasing;
/// the wrapper is reclaimed on its behalf. A backend the server no longer
/// reports (or reports without a state) is dead weight and is closed.
pub async fn probe(prober: &SessionWrapper, target: &SessionWrapper) -> ProbeOutcome {
    match prober.session().backend_state(target.backend_pid()).await {
        Ok(Some(state)) if state.eq_ignore_ascii_case("idle") => {
            target.release().await;
            tracing::debug!(
                wrapper = target.id(),
                backend_pid = target.backend_pid(),
                "reclaimed idle session"
            );
            ProbeOutcome::Reclaimed
        }
        Ok(Some(_)) => ProbeOutcome::Busy,
        Ok(None) => {
            if let Err(e) = target.close().await {
                tracing::debug!(
                    wrapper = target.id(),
                    error = %e,
                    "vanished session closed with errors"
                );
            }
            tracing::warn!(
                wrapper = target.id(),
                backend_pid = target.backend_pid(),
                "backend no longer reported by server, session closed"
            );
            ProbeOutcome::Gone
        }
        Err(e) => {
            tracing::warn!(
                wrapper = target.id(),
                backend_pid = target.backend_pid(),
                error = %e,
                "backend state probe failed"
            );
            ProbeOutcome::Skipped
        }
    }
}
