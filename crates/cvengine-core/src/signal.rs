use cvengine_remote::CancelToken;

/// Route Ctrl-C to `cancel`. The run then tears down before returning; a
/// second Ctrl-C exits immediately.
pub fn install_signal_handler(cancel: CancelToken) {
    let _ = ctrlc::set_handler(move || {
        if cancel.is_cancelled() {
            std::process::exit(130);
        }
        cancel.cancel();
        eprintln!("\ncancellation requested, tearing down (Ctrl-C again to exit now)...");
    });
}
