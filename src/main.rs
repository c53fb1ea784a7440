use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use nutrisignal::backend::{FoodScan, ProfileUpdate};
use nutrisignal::config::AppConfig;
use nutrisignal::screens::scan::NUTRITION_TITLE;
use nutrisignal::screens::{FilePicker, Notice};
use nutrisignal::{App, AppError};

const SESSION_WAIT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(
    name = "nutrisignal",
    about = "Classify food photos and keep a scan history",
    long_about = "Command-line front end for NutriSignal: sign in, classify food photos, save scans and review stats."
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create an account
    Signup {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
        #[arg(long)]
        first_name: String,
        #[arg(long)]
        last_name: String,
    },
    /// Sign in with email and password
    Login {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
    },
    /// Sign out
    Logout,
    /// Show the signed-in user
    Whoami,
    /// Complete email confirmation from the emailed callback link
    Confirm { url: String },
    /// Classify a food photo
    Scan {
        image: PathBuf,
        /// Save the result to your history
        #[arg(long)]
        save: bool,
        /// Also print the nutrition facts
        #[arg(long)]
        nutrition: bool,
    },
    /// Scan counts per signal
    Stats,
    /// Saved scans, most recent first
    History,
    /// Profile commands
    Profile {
        #[command(subcommand)]
        action: ProfileCommand,
    },
    /// Record height and weight and finish onboarding
    Onboard {
        /// FEET'INCHES (e.g. 5'10), or centimetres with --metric
        #[arg(long)]
        height: String,
        /// Pounds, or kilograms with --metric
        #[arg(long)]
        weight: String,
        #[arg(long)]
        metric: bool,
    },
}

#[derive(Subcommand)]
enum ProfileCommand {
    Show,
    Update {
        #[arg(long)]
        first_name: Option<String>,
        #[arg(long)]
        last_name: Option<String>,
        #[arg(long)]
        height_cm: Option<f64>,
        #[arg(long)]
        weight_kg: Option<f64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let env_filter =
        std::env::var("RUST_LOG").unwrap_or_else(|_| "nutrisignal=debug".to_string());
    let json_logs = std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false);

    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
    }

    let cli = Cli::parse();
    let app = App::init(AppConfig::from_env()?).await?;
    app.session.ready().await;

    let outcome = run(&app, cli.command).await;
    app.shutdown();

    if let Err(e) = outcome {
        let notice = Notice::from(&e);
        eprintln!("{}: {}", notice.title, notice.message);
        std::process::exit(1);
    }
    Ok(())
}

async fn run(app: &App, command: Command) -> Result<(), AppError> {
    match command {
        Command::Signup {
            email,
            password,
            first_name,
            last_name,
        } => {
            let mut login = app.login_screen();
            login.toggle_mode();
            login.email = email;
            login.password = password;
            login.first_name = first_name;
            login.last_name = last_name;
            login.submit().await?;
            match login.success_message {
                Some(msg) => println!("{msg}"),
                None => println!("Account created."),
            }
        }
        Command::Login { email, password } => {
            let mut login = app.login_screen();
            login.email = email;
            login.password = password;
            login.submit().await?;
            let state = tokio::time::timeout(
                SESSION_WAIT,
                app.session.wait_until(|s| s.user.is_some()),
            )
            .await
            .map_err(|_| AppError::Auth("Timed out waiting for session".into()))?;
            if let Some(user) = state.user {
                println!("Signed in as {}", user.email);
            }
        }
        Command::Logout => {
            app.profile_screen().sign_out().await?;
            println!("Signed out.");
        }
        Command::Whoami => {
            let state = app.session.snapshot();
            match &state.user {
                Some(user) => println!("{} ({:?})", user.email, state.route()),
                None => println!("Not logged in"),
            }
        }
        Command::Confirm { url } => {
            let mut login = app.login_screen();
            if app.session.handle_deep_link(&url).await && login.absorb_auth_message() {
                println!("{}", login.success_message.unwrap_or_default());
            } else {
                println!("Link was not a valid confirmation link.");
            }
        }
        Command::Scan {
            image,
            save,
            nutrition,
        } => {
            let scan = app.scan_screen(Arc::new(FilePicker::new(image)));
            scan.choose().await?;
            scan.classify().await;
            if nutrition {
                scan.toggle_nutrition();
            }
            let view = scan.view();
            if let Some(error) = &view.error {
                println!("{error}");
            }
            if let Some(card) = &view.card {
                println!("{}", card.headline);
                println!("{}", card.score);
                if let Some(system) = &card.scoring_system {
                    println!("Scored by {system}");
                }
                if let Some(rows) = &card.nutrition {
                    println!("{NUTRITION_TITLE}");
                    for row in rows {
                        println!("  {:<10} {}", row.name, row.display_value());
                    }
                }
            }
            if save {
                let notice = scan.save().await?;
                println!("{}", notice.message);
            }
        }
        Command::Stats => {
            let view = app.profile_screen().load().await?;
            println!("{}", view.email);
            println!(
                "Total: {}  🟢 {}  🟡 {}  🔴 {}",
                view.stats.total, view.stats.green, view.stats.yellow, view.stats.red
            );
        }
        Command::History => {
            let view = app.profile_screen().load().await?;
            if view.history.is_empty() {
                println!("No scans yet.");
            }
            for scan in &view.history {
                print_scan(scan);
            }
        }
        Command::Profile { action } => {
            let profile = match action {
                ProfileCommand::Show => app.session.fetch_user_profile().await?,
                ProfileCommand::Update {
                    first_name,
                    last_name,
                    height_cm,
                    weight_kg,
                } => {
                    let update = ProfileUpdate {
                        first_name,
                        last_name,
                        height_cm,
                        weight_kg,
                        onboarding_completed: None,
                    };
                    if update.is_empty() {
                        return Err(AppError::validation("Nothing to update"));
                    }
                    app.session.update_user_profile(update).await?
                }
            };
            match profile {
                Some(p) => {
                    println!("Name:       {}", p.display_name().unwrap_or_default());
                    println!("Email:      {}", p.email.unwrap_or_default());
                    println!("Height:     {}", fmt_opt(p.height_cm, "cm"));
                    println!("Weight:     {}", fmt_opt(p.weight_kg, "kg"));
                    println!("Onboarded:  {}", p.onboarding_completed.unwrap_or(false));
                }
                None => println!("No profile."),
            }
        }
        Command::Onboard {
            height,
            weight,
            metric,
        } => {
            let mut form = app.onboarding_screen();
            if metric {
                form.toggle_height_unit();
                form.toggle_weight_unit();
                form.height_cm = height;
                form.weight_kg = weight;
            } else {
                let (feet, inches) = height.split_once('\'').unwrap_or((height.as_str(), ""));
                form.feet = feet.to_string();
                form.inches = inches.trim_end_matches('"').to_string();
                form.weight_lbs = weight;
            }
            form.submit().await?;
            println!(
                "Saved: {} cm, {} kg",
                form.height_in_cm(),
                form.weight_in_kg()
            );
        }
    }
    Ok(())
}

fn print_scan(scan: &FoodScan) {
    let when = scan
        .timestamp
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default();
    let score = scan
        .score
        .map_or_else(|| "N/A".to_string(), |s| format!("{s:.1}"));
    println!(
        "{} {:<20} {:>5}  {}",
        scan.signal.indicator(),
        scan.food_label,
        score,
        when
    );
}

fn fmt_opt(value: Option<f64>, unit: &str) -> String {
    value.map_or_else(|| "N/A".to_string(), |v| format!("{v} {unit}"))
}
