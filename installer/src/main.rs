use pdns_stack_installer::cli::InstallArgs;

#[tokio::main]
async fn main() {
    let args = InstallArgs::from_env();

    // Exit codes: 0 success, 1 any failure (message already logged when possible).
    let code = match pdns_stack_installer::run(args).await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            1
        }
    };
    std::process::exit(code);
}
