//! A provider that reads the Resource Graph from a YAML file.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use gantry_api::ControllerResources;
use gantry_core::runner::ProviderStore;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

pub(crate) struct FileProvider {
    pub path: PathBuf,
    pub controller_name: String,
    pub gateway_class_name: Option<String>,
    pub poll_interval: Duration,
}

impl FileProvider {
    /// Poll the resource file until cancelled, publishing it to the provider
    /// store whenever it changes.
    ///
    /// A file that can't be read or parsed is logged and skipped. The last
    /// good set of resources stays published.
    pub(crate) async fn run(self, store: ProviderStore, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,
                _ = interval.tick() => (),
            }

            match self.load().await {
                Ok(resources) => store.store(self.controller_name.clone(), Arc::new(resources)),
                Err(e) => tracing::warn!(
                    path = %self.path.display(),
                    err = %format!("{e:#}"),
                    "failed to load resources"
                ),
            }
        }

        tracing::info!("file provider stopped");
    }

    async fn load(&self) -> anyhow::Result<ControllerResources> {
        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .context("failed to read resource file")?;

        let mut resources: ControllerResources =
            serde_yml::from_str(&contents).context("failed to parse resource file")?;

        if let Some(class) = &self.gateway_class_name {
            resources.0.retain(|r| r.class_name() == class);
        }
        resources.sort();

        Ok(resources)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const RESOURCES: &str = r#"
- gatewayClass:
    metadata:
      name: b-class
    spec:
      controllerName: gantry.io/gateway-controller
- gatewayClass:
    metadata:
      name: a-class
    spec:
      controllerName: gantry.io/gateway-controller
"#;

    fn provider(name: &str, class: Option<&str>) -> FileProvider {
        let path = std::env::temp_dir().join(format!("gantry-{}-{name}.yaml", std::process::id()));
        std::fs::write(&path, RESOURCES).unwrap();

        FileProvider {
            path,
            controller_name: "gantry.io/gateway-controller".to_string(),
            gateway_class_name: class.map(str::to_string),
            poll_interval: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn test_load_sorts() {
        let provider = provider("sorts", None);
        let resources = provider.load().await.unwrap();

        let classes: Vec<_> = resources.iter().map(|r| r.class_name()).collect();
        assert_eq!(classes, vec!["a-class", "b-class"]);
    }

    #[tokio::test]
    async fn test_load_filters_class() {
        let provider = provider("filters", Some("b-class"));
        let resources = provider.load().await.unwrap();

        let classes: Vec<_> = resources.iter().map(|r| r.class_name()).collect();
        assert_eq!(classes, vec!["b-class"]);
    }

    #[tokio::test]
    async fn test_run_publishes() {
        let provider = provider("publishes", None);
        let store = ProviderStore::new();
        let cancel = CancellationToken::new();

        let task = tokio::spawn(provider.run(store.clone(), cancel.clone()));

        let mut sub = store.subscribe();
        loop {
            let snapshot = sub.recv().await.unwrap();
            if !snapshot.updates.is_empty() {
                assert_eq!(snapshot.updates[0].key, "gantry.io/gateway-controller");
                assert_eq!(snapshot.updates[0].value.len(), 2);
                break;
            }
        }

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_file() {
        let mut provider = provider("missing", None);
        provider.path = PathBuf::from("/does/not/exist.yaml");

        let err = provider.load().await.unwrap_err();
        assert!(format!("{err:#}").contains("failed to read resource file"));
    }
}
