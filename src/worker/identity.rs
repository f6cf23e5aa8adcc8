//! Worker identity announced to the orchestrator.

use uuid::Uuid;

/// Name and capabilities of this worker. Fixed for the process lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerIdentity {
    /// `<uuid>@<hostname>` unless overridden.
    pub name: String,
    /// Command names this worker can run.
    pub capabilities: Vec<String>,
}

impl WorkerIdentity {
    pub fn new(name_override: Option<String>, capabilities: Vec<String>) -> Self {
        let name = name_override
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(generate_name);
        Self { name, capabilities }
    }
}

/// Fresh worker name: a random id at the local host name.
pub fn generate_name() -> String {
    format!("{}@{}", Uuid::new_v4(), hostname())
}

/// Local host name, falling back to `$HOSTNAME` then `localhost`.
pub fn hostname() -> String {
    #[cfg(unix)]
    {
        let mut buf = [0u8; 256];
        let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
        if rc == 0 {
            let len = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
            let name = String::from_utf8_lossy(&buf[..len]).trim().to_string();
            if !name.is_empty() {
                return name;
            }
        }
    }
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}
