use anyhow::{Context, Result};
use clap::Parser;
use dialoguer::Password;
use reqwest::Method;

use storefront_auth::auth::{unix_now, LoginOutcome, OtpPurpose};
use storefront_auth::config::{CliArgs, Command, Config};
use storefront_auth::navigation::NavigationDecision;
use storefront_auth::runtime::AuthRuntime;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if it exists
    dotenvy::dotenv().ok();

    let args = CliArgs::parse();
    let config = Config::from_args(&args)?;
    config.validate()?;

    // Initialize logging with a configured level
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::debug!(
        api_url = %config.api_url,
        store = %config.store_file.display(),
        "Starting"
    );

    let runtime = AuthRuntime::new(&config)?;
    let session = runtime.bootstrap().await;
    tracing::debug!(authenticated = session.authenticated, "Session restored");

    match args.command {
        Command::Login { email } => {
            let password = prompt_password()?;
            let outcome = runtime.auth().login(&email, &password).await?;
            report_login(outcome);
        }
        Command::Register { name, email } => {
            let password = prompt_password()?;
            let outcome = runtime.auth().register(&name, &email, &password).await?;
            report_login(outcome);
        }
        Command::VerifyOtp {
            email,
            otp,
            registration,
        } => {
            let purpose = if registration {
                OtpPurpose::Registration
            } else {
                OtpPurpose::Login
            };
            let outcome = runtime.auth().verify_otp(&email, &otp, purpose).await?;
            report_login(outcome);
        }
        Command::Logout => {
            runtime.auth().logout().await?;
            println!("Logged out");
        }
        Command::Status => print_status(&runtime),
        Command::Get { path } => {
            let request = runtime
                .http()
                .request(Method::GET, &path)
                .build()
                .context("Failed to build request")?;
            let response = runtime.http().dispatch(request).await?;
            println!("{}", response.status());
            println!("{}", response.text().await.context("Failed to read body")?);
        }
        Command::Navigate { path } => match runtime.guard().navigate(&path).await {
            NavigationDecision::Allow => println!("allow {}", path),
            NavigationDecision::Redirect { to } => println!("redirect {}", to),
            NavigationDecision::Superseded => println!("superseded {}", path),
        },
        Command::Watch => watch(&runtime).await?,
    }

    Ok(())
}

fn prompt_password() -> Result<String> {
    let password: String = Password::new()
        .with_prompt("Password")
        .interact()
        .context("Failed to read password")?;

    if password.is_empty() {
        anyhow::bail!("Password cannot be empty");
    }
    Ok(password)
}

fn report_login(outcome: LoginOutcome) {
    match outcome {
        LoginOutcome::Authenticated(user) => {
            let who = user.map(|u| u.email.unwrap_or(u.id));
            println!("Logged in as {}", who.as_deref().unwrap_or("unknown user"));
        }
        LoginOutcome::OtpRequired { email } => {
            println!("A one-time code was sent to {}", email);
            println!("Complete with: storefront-auth verify-otp --email {} <code>", email);
        }
    }
}

fn print_status(runtime: &AuthRuntime) {
    let session = runtime.session().current();
    let credential = runtime.store().get();
    let status = runtime.coordinator().status();

    println!("  Authenticated: {}", session.authenticated);
    if let Some(user) = &session.user {
        println!("  User:          {}", user.email.as_deref().unwrap_or(&user.id));
    }
    println!("  Token:         {:?}", status);

    if let Some(credential) = &credential {
        if let Some(token) = &credential.access_token {
            let prefix: String = token.chars().take(20).collect();
            println!("  Access token:  {}...", prefix);
        }
        if let Some(exp) = credential.expires_at() {
            let remaining = exp - unix_now();
            match chrono::DateTime::from_timestamp(exp, 0) {
                Some(at) => println!("  Expires:       {} ({}s)", at.to_rfc3339(), remaining),
                None => println!("  Expires:       {}", exp),
            }
        }
        println!(
            "  Refresh:       {}",
            if credential.refresh_token.is_some() || runtime.store().refresh_cookie().is_some() {
                "available"
            } else {
                "none"
            }
        );
    }

    if let Some(cart) = runtime.store().guest_cart_token() {
        let prefix: String = cart.token.chars().take(8).collect();
        println!("  Guest cart:    {}...", prefix);
    }
}

/// Keep the session alive with the periodic timer until Ctrl-C
async fn watch(runtime: &AuthRuntime) -> Result<()> {
    let timer = runtime.start_refresh_timer();
    let mut session = runtime.session().subscribe();
    tracing::info!("Watching session, press Ctrl-C to stop");

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to install Ctrl+C handler")?;
                tracing::info!("Received Ctrl+C signal, stopping");
                break;
            }
            changed = session.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = session.borrow_and_update().clone();
                tracing::info!(
                    authenticated = current.authenticated,
                    loading = current.loading,
                    user = current.user.as_ref().map(|u| u.id.as_str()).unwrap_or("-"),
                    "Session changed"
                );
            }
        }
    }

    timer.stop();
    Ok(())
}
