fn main() {
    if let Err(err) = sandbox_relay::cli::run_sandbox_relay() {
        tracing::error!(error = %err, "sandbox-relay failed");
        std::process::exit(1);
    }
}
