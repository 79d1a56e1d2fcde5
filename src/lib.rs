//! Auth-session and profile synchronization.
//!
//! ARCHITECTURE
//! ============
//! - `session`: identity-provider model and the [`SessionSource`] seam.
//! - `profile`: profile model and the [`ProfileStore`] seam.
//! - `gotrue`: HTTP `SessionSource` for GoTrue-compatible providers.
//! - `db`: Postgres `ProfileStore` and pool setup.
//! - `services`: idempotent provisioning and the session synchronizer.
//! - `state`: the observable read model.

pub mod config;
pub mod db;
pub mod error;
pub mod gotrue;
pub mod profile;
pub mod services;
pub mod session;
pub mod state;

pub use error::ErrorCode;
pub use profile::{NewProfile, Profile, ProfilePatch, ProfileStore, Role, StoreError};
pub use services::provision::{ProfileProvisioner, ProvisionError};
pub use services::sync::{SessionSynchronizer, UpdateProfileError};
pub use session::{AuthChange, AuthError, Identity, Session, SessionEvent, SessionSource, SignupMetadata};
pub use state::{AuthGate, SyncPhase, SyncState, should_redirect_unauth};
