use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[cfg(unix)]
use signal_hook::consts::signal::{SIGINT, SIGTERM};
#[cfg(unix)]
use signal_hook::flag;
#[cfg(unix)]
use signal_hook::low_level::unregister;
#[cfg(unix)]
use signal_hook::SigId;

/// Cloneable view of the broker-wide shutdown flag.
#[derive(Clone, Debug, Default)]
pub struct ShutdownSignal {
    triggered: Arc<AtomicBool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.triggered.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }
}

/// SIGINT/SIGTERM registration feeding a [`ShutdownSignal`]. Unregisters on drop.
pub struct ShutdownHooks {
    signal: ShutdownSignal,
    #[cfg(unix)]
    sig_ids: Vec<SigId>,
}

impl ShutdownHooks {
    pub fn install() -> io::Result<Self> {
        Self::install_for(ShutdownSignal::new())
    }

    pub fn install_for(signal: ShutdownSignal) -> io::Result<Self> {
        #[cfg(unix)]
        {
            let id_int = flag::register(SIGINT, Arc::clone(&signal.triggered))?;
            let id_term = flag::register(SIGTERM, Arc::clone(&signal.triggered))?;
            Ok(Self {
                signal,
                sig_ids: vec![id_int, id_term],
            })
        }

        #[cfg(not(unix))]
        {
            Ok(Self { signal })
        }
    }

    pub fn signal(&self) -> ShutdownSignal {
        self.signal.clone()
    }

    pub fn is_triggered(&self) -> bool {
        self.signal.is_triggered()
    }
}

impl Drop for ShutdownHooks {
    fn drop(&mut self) {
        #[cfg(unix)]
        for id in self.sig_ids.drain(..) {
            unregister(id);
        }
    }
}
