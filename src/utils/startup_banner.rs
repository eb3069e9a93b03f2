use crate::config::AppConfig;

pub fn print_startup_banner(app_config: &AppConfig) {
    const RESET: &str = "\x1b[0m";
    const BANNER_COLOR: &str = "\x1b[38;5;31m";
    const DIM_GRAY: &str = "\x1b[2;90m";
    const BANNER: &str = r#"
  _   _     _
 | |_(_) __| | ___ _ __ ___   __ _
 | __| |/ _` |/ _ \ '_ ` _ \ / _` |
 | |_| | (_| |  __/ | | | | | (_| |
  \__|_|\__,_|\___|_| |_| |_|\__, |
                                |_|"#;
    const APP_DESCRIPTION: &str =
        "Priority-ordered, disk-backed message queue broker over TCP.";
    const LIABILITY_NOTICE: &str =
        "MIT License disclaimer: software is provided \"AS IS\", without warranty or liability.";

    println!("{BANNER_COLOR}");
    println!("{BANNER}{RESET}");
    println!(
        "{} v{} | build {}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        env!("TIDEMQ_BUILD_DATE_UTC")
    );
    println!("{APP_DESCRIPTION}");
    println!(
        "Queue manager {} on {}:{}",
        app_config.manager.name, app_config.server.host, app_config.server.port
    );
    println!("{DIM_GRAY}{LIABILITY_NOTICE}{RESET}");
    println!();
    println!("================================================================");
    println!();
}
