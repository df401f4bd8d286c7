//! pilot-probe：连通性探针
//!
//! 申请一台远端设备、建立动作通道、截一张图存入产物目录，然后释放设备。
//! 给出状态目录时，再用平台视觉服务识别当前屏幕处于哪个状态（`Error` 时按配置纠偏）。
//! 用法：`pilot-probe [配置文件路径] [状态id=描述 ...]`

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use screen_pilot::actions::ActionModelLocator;
use screen_pilot::api::ApiClient;
use screen_pilot::artifacts::{screenshot_and_log, LocalArtifactStore};
use screen_pilot::channel::WsConnector;
use screen_pilot::config::load_config;
use screen_pilot::device::{DevicePool, RemoteDeviceService};
use screen_pilot::observability;
use screen_pilot::pilot::{PilotError, ERROR_STATE};
use screen_pilot::{Arguments, AutomationSession, Goal, Pilot, Signal, State, StateGraph};

/// `Id=描述` 形式的参数组成只含状态、不含转移的图
fn probe_graph<I: IntoIterator<Item = String>>(specs: I) -> anyhow::Result<Option<StateGraph>> {
    let mut graph = StateGraph::new();
    for spec in specs {
        let (id, description) = spec
            .split_once('=')
            .with_context(|| format!("Expected STATE=description, got '{}'", spec))?;
        graph.add_state(State::new(id.trim(), description.trim()))?;
    }
    let known = graph.states().next().is_some();
    Ok(known.then_some(graph))
}

/// 识别到任一已知状态即结束
fn settle_on_known_state() -> Goal {
    Goal::new(Vec::<String>::new(), |state, _| {
        if state == ERROR_STATE {
            Ok(())
        } else {
            Err(Signal::Complete(Some(format!("screen is at {}", state))))
        }
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let mut args = std::env::args().skip(1).peekable();
    let config_path = args.next_if(|a| !a.contains('=')).map(PathBuf::from);
    let cfg = load_config(config_path).context("Failed to load configuration")?;
    let catalogue = probe_graph(args)?;

    let api = ApiClient::from_config(&cfg.api);
    let pool = DevicePool::from_config(Arc::new(RemoteDeviceService::new(api.clone())), &cfg.device);
    let session = AutomationSession::from_config(&cfg, pool, Arc::new(WsConnector::from_config(&cfg.channel)))
        .with_locator(Arc::new(ActionModelLocator::new(api.clone())));

    let run_id = uuid::Uuid::new_v4().to_string();
    let store = Arc::new(LocalArtifactStore::for_run(&cfg.artifacts, &run_id));
    tracing::info!(run_id = %run_id, group = session.group(), "Probing remote device");

    let (api, cfg_ref, store_ref) = (&api, &cfg, &store);
    let (path, state) = session
        .run(&run_id, |handle| async move {
            tracing::info!(device = %handle.device().name, "Remote device connected");
            let actions = handle.actions();
            let path = screenshot_and_log(actions.as_ref(), store_ref.as_ref(), "Probe")
                .await
                .map_err(|e| PilotError::Transition {
                    name: "probe".to_string(),
                    source: e.into(),
                })?;

            let state = match catalogue {
                Some(graph) => {
                    let mut pilot = Pilot::builder(graph)
                        .remote(api, actions, cfg_ref)
                        .artifacts(store_ref.clone())
                        .build()?;
                    pilot.run(&settle_on_known_state(), &Arguments::new()).await?.final_state
                }
                None => None,
            };
            Ok((path, state))
        })
        .await
        .context("Probe failed")?;

    println!("{}", path.display());
    if let Some(state) = state {
        println!("{}", state);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_graph_from_args() {
        let graph = probe_graph(vec!["Login=Login form".to_string(), "Home = Main menu".to_string()])
            .unwrap()
            .unwrap();
        assert_eq!(graph.description("Home"), "Main menu");
        assert_eq!(graph.catalogue().len(), 2);

        assert!(probe_graph(Vec::new()).unwrap().is_none());
        assert!(probe_graph(vec!["Login".to_string()]).is_err());
    }

    #[test]
    fn test_goal_waits_out_error_state() {
        let goal = settle_on_known_state();
        assert!(goal.check(ERROR_STATE, &Arguments::new()).is_ok());
        assert!(matches!(
            goal.check("Home", &Arguments::new()),
            Err(Signal::Complete(Some(ref s))) if s == "screen is at Home"
        ));
    }
}
