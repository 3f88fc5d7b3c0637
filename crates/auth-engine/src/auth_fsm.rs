//! Coordinator state machine using rust-fsm.
//!
//! ## State Diagram
//!
//! ```text
//!            Mount (landing route only)
//!  Init ───────────────────────────────► CheckingBackendCookie ── BackendVerified ──► Authenticated
//!   │                                      │ BackendMissing / BackendRejected              │
//!   │ CredentialsProvided                  ▼                                               │ SessionLost
//!   │                      ┌──────► CheckingExternalSource ── NoExternalTokens ──► Unauthenticated
//!   │                      │               │ ExternalTokensFound                    │   │
//!   │     RetryAfterBackoff│               ▼                                        │   │ PollExternal
//!   └──────────────────────┼─────────► Transferring ◄──── CredentialsProvided ──────┘   │
//!                          │               │ CookiesWritten / TransferSkipped           │
//!                          │               ▼                                            │
//!                        Failed ◄──── Verifying ── StatusVerified ──► Authenticated     │
//!                          │   VerificationExhausted / TransferFailed                   │
//!                          └── RetriesExhausted ──► Unauthenticated ◄───────────────────┘
//! ```
//!
//! `SignOutRequested` leads to `Unauthenticated` from every state.

use rust_fsm::*;
use serde::{Deserialize, Serialize};

// Generates module `coordinator_machine` with State, Input and StateMachine.
state_machine! {
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub coordinator_machine(Init)

    Init => {
        Mount => CheckingBackendCookie,
        CredentialsProvided => Transferring,
        // Session died while parked on a protected route
        SessionLost => Unauthenticated,
        SignOutRequested => Unauthenticated
    },
    CheckingBackendCookie => {
        BackendVerified => Authenticated,
        // No access cookie on the backend domain
        BackendMissing => CheckingExternalSource,
        // Cookie present but the server said no; a refresh may still work
        BackendRejected => CheckingExternalSource,
        SignOutRequested => Unauthenticated
    },
    CheckingExternalSource => {
        ExternalTokensFound => Transferring,
        NoExternalTokens => Unauthenticated,
        SignOutRequested => Unauthenticated
    },
    Transferring => {
        CookiesWritten => Verifying,
        // Another transfer holds the lock; wait for its cookies instead
        TransferSkipped => Verifying,
        TransferFailed => Failed,
        SignOutRequested => Unauthenticated
    },
    Verifying => {
        StatusVerified => Authenticated,
        VerificationExhausted => Failed,
        SignOutRequested => Unauthenticated
    },
    Failed => {
        RetryAfterBackoff => CheckingExternalSource,
        RetriesExhausted => Unauthenticated,
        SignOutRequested => Unauthenticated
    },
    Authenticated => {
        SessionLost => CheckingBackendCookie,
        SignOutRequested => Unauthenticated
    },
    Unauthenticated => {
        PollExternal => CheckingExternalSource,
        CredentialsProvided => Transferring,
        SignOutRequested => Unauthenticated
    }
}

pub use coordinator_machine::Input as CoordinatorInput;
pub use coordinator_machine::State as CoordinatorMachineState;
pub use coordinator_machine::StateMachine as CoordinatorMachine;

/// Coordinator phase for external consumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CoordinatorPhase {
    Init,
    CheckingBackendCookie,
    CheckingExternalSource,
    Transferring,
    Verifying,
    Failed,
    Authenticated,
    Unauthenticated,
}

impl CoordinatorPhase {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, CoordinatorPhase::Authenticated)
    }

    /// No cycle is running and none is scheduled to resume on its own,
    /// except external polling.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            CoordinatorPhase::Init
                | CoordinatorPhase::Authenticated
                | CoordinatorPhase::Unauthenticated
        )
    }
}

impl From<&CoordinatorMachineState> for CoordinatorPhase {
    fn from(state: &CoordinatorMachineState) -> Self {
        match state {
            CoordinatorMachineState::Init => CoordinatorPhase::Init,
            CoordinatorMachineState::CheckingBackendCookie => CoordinatorPhase::CheckingBackendCookie,
            CoordinatorMachineState::CheckingExternalSource => {
                CoordinatorPhase::CheckingExternalSource
            }
            CoordinatorMachineState::Transferring => CoordinatorPhase::Transferring,
            CoordinatorMachineState::Verifying => CoordinatorPhase::Verifying,
            CoordinatorMachineState::Failed => CoordinatorPhase::Failed,
            CoordinatorMachineState::Authenticated => CoordinatorPhase::Authenticated,
            CoordinatorMachineState::Unauthenticated => CoordinatorPhase::Unauthenticated,
        }
    }
}
