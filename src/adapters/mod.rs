//! Adapters — concrete transports and IPC endpoints.
//!
//! | Adapter  | Implements | Connects to                       |
//! |----------|------------|-----------------------------------|
//! | `mei`    | Transport  | MEI character device (`/dev/mei0`) |
//! | `sim`    | Transport  | In-process co-processor model     |
//! | `socket` | Remote     | Unix-domain socket clients        |

#[cfg(any(target_os = "linux", target_os = "android"))]
pub mod mei;
pub mod sim;
#[cfg(unix)]
pub mod socket;
