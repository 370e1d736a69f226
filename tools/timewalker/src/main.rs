fn main() {
    timewalker::logging::init_tracing();
    match timewalker::run() {
        Ok(code) => std::process::exit(code),
        Err(error) => {
            eprintln!("{error}");
            if let Some(bundle) = error.bundle() {
                eprintln!("partial bundle: {}", bundle.display());
            }
            std::process::exit(error.exit_code());
        }
    }
}
