use buildsect_cli::{app, cli, logging};

#[tokio::main]
async fn main() {
    let matches = cli::command().get_matches();
    let parsed = match cli::parse(&matches) {
        Ok(parsed) => parsed,
        Err(e) => {
            eprintln!("error: {e:#}");
            std::process::exit(app::FAILURE_CODE);
        }
    };
    logging::init_subscriber(parsed.verbosity, parsed.no_color);

    let code = match app::execute(parsed).await {
        Ok(exit) => exit.code(),
        Err(e) => {
            eprintln!("error: {e:#}");
            app::FAILURE_CODE
        }
    };
    std::process::exit(code);
}
