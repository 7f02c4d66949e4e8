use exitcode::ExitCode;

use std::process;

use mrvpn_lib::ipc::client;
use mrvpn_lib::rpc::Response;

mod cli;

#[tokio::main]
async fn main() {
    let args = cli::parse();

    let id = uuid::Uuid::new_v4().to_string();
    let method = match &args.command {
        cli::Command::Status {} => "status",
        cli::Command::Connect { .. } => "connect",
        cli::Command::Disconnect {} => "disconnect",
        cli::Command::Apps {} => "apps",
        cli::Command::SplitGet {} | cli::Command::SplitSet { .. } => "split",
        cli::Command::Ping { .. } => "ping",
        cli::Command::Shutdown {} => "shutdown",
    };
    let request = args.command.into_request(id);

    let response = match client::process_request(&args.endpoint, &request).await {
        Ok(response) => response,
        Err(e) => {
            eprintln!("Error processing {method}: {e}");
            process::exit(exitcode::UNAVAILABLE);
        }
    };

    if args.json {
        json_print(&response)
    } else {
        pretty_print(&request.method, &response)
    };

    process::exit(determine_exitcode(&response));
}

fn json_print(response: &Response) {
    let payload = response
        .result
        .clone()
        .or_else(|| response.error.as_ref().and_then(|e| serde_json::to_value(e).ok()))
        .unwrap_or(serde_json::Value::Null);
    match serde_json::to_string_pretty(&payload) {
        Ok(s) => println!("{s}"),
        Err(e) => eprintln!("Error serializing response to JSON: {e}"),
    }
}

fn pretty_print(method: &str, response: &Response) {
    if let Some(error) = &response.error {
        eprintln!("Error ({}): {}", error.code, error.message);
        return;
    }
    let Some(result) = &response.result else {
        println!();
        return;
    };

    match method {
        "vpn.status" => {
            let state = result["state"].as_str().unwrap_or("unknown");
            match result["serverName"].as_str() {
                Some(server) => {
                    let protocol = result["protocol"].as_str().unwrap_or("?");
                    println!("State: {state} ({server}, {protocol})");
                }
                None => println!("State: {state}"),
            }
            if let Some(connected_at) = result["connectedAt"].as_u64() {
                println!("Connected since (unix): {connected_at}");
            }
        }
        "vpn.connect" | "vpn.disconnect" => {
            println!("State: {}", result["state"].as_str().unwrap_or("unknown"));
        }
        "apps.list" => {
            let apps = result.as_array().cloned().unwrap_or_default();
            if apps.is_empty() {
                println!("No applications found.");
            }
            for app in apps {
                let name = app["name"].as_str().unwrap_or("?");
                let exe = app["exeName"].as_str().unwrap_or("?");
                let uwp = if app["isUwp"].as_bool().unwrap_or(false) { " [uwp]" } else { "" };
                println!("{name} ({exe}){uwp}");
            }
        }
        "split.setConfig" | "split.getConfig" => {
            println!("Mode: {}", result["mode"].as_str().unwrap_or("?"));
            if let Some(apps) = result["apps"].as_array() {
                for app in apps {
                    println!("  app: {}", app.as_str().unwrap_or("?"));
                }
            }
            if let Some(domains) = result["domains"].as_array() {
                for domain in domains {
                    println!("  domain: {}", domain.as_str().unwrap_or("?"));
                }
            }
            println!("Invert: {}", result["invert"].as_bool().unwrap_or(false));
        }
        "servers.ping" => match result["latency"].as_u64() {
            Some(latency) => println!("Latency: {latency} ms"),
            None => eprintln!("Ping failed: {}", result["error"].as_str().unwrap_or("unknown")),
        },
        "service.shutdown" => {
            println!("Shutdown scheduled.");
        }
        _ => match serde_json::to_string_pretty(result) {
            Ok(s) => println!("{s}"),
            Err(e) => eprintln!("Error serializing response: {e}"),
        },
    }
}

fn determine_exitcode(response: &Response) -> ExitCode {
    if response.error.is_some() {
        return exitcode::PROTOCOL;
    }
    if let Some(result) = &response.result {
        if result.get("error").map(|e| !e.is_null()).unwrap_or(false) {
            return exitcode::UNAVAILABLE;
        }
    }
    exitcode::OK
}
