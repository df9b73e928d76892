use crate::engine::QueryController;
use crate::error::{RepositoryError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Interrupts every query of a session once the session is gone.
#[derive(Default)]
pub struct UnreferencedController {
    unreferenced: AtomicBool,
}

impl UnreferencedController {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn unreferenced(&self) {
        self.unreferenced.store(true, Ordering::SeqCst);
    }

    pub fn is_unreferenced(&self) -> bool {
        self.unreferenced.load(Ordering::SeqCst)
    }

    /// Combines this controller with a caller supplied one; both are polled.
    pub fn merge(
        self: &Arc<Self>,
        other: Option<Arc<dyn QueryController>>,
    ) -> Arc<dyn QueryController> {
        let session: Arc<dyn QueryController> = self.clone();
        match other {
            None => session,
            Some(other) => Arc::new(MergedController {
                session: self.clone(),
                other,
            }),
        }
    }
}

impl QueryController for UnreferencedController {
    fn continue_check(&self) -> Result<()> {
        if self.is_unreferenced() {
            Err(RepositoryError::FetchInterrupted(
                "remote session was closed".into(),
            ))
        } else {
            Ok(())
        }
    }
}

struct MergedController {
    session: Arc<UnreferencedController>,
    other: Arc<dyn QueryController>,
}

impl QueryController for MergedController {
    fn continue_check(&self) -> Result<()> {
        self.session.continue_check()?;
        self.other.continue_check()
    }

    fn begin(&self) {
        self.other.begin();
    }

    fn close(&self) {
        self.other.close();
    }
}
