use crate::progress::TerminalProgress;
use crate::prompt::Prompter;
use anyhow::{anyhow, bail, Result};
use rmcard_catalog::{
    auto_detect_backend, filter_by_manufacturer, manifest_locations, manufacturer_choices,
    scan_models, Backend, MODELS_DIR,
};
use rmcard_classifier::{
    find_master_disk, find_unique_target_card, target_card_candidates, DiscoveryError, TargetCard,
};
use rmcard_config::ConfigStore;
use rmcard_core::{CardRole, Configuration, DeviceInventory, InventorySource, ModelEntry, TargetCardSpec};
use rmcard_host_linux::unmount_partitions;
use rmcard_provision::{run_provision, BackendChoice, ProvisionPlan, StepStatus, Vram};
use rmcard_safety::SafetyContext;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Answers supplied up front; anything left `None` is asked for.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub backend: Option<BackendChoice>,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub vram: Option<Vram>,
    pub skip_dev_config: bool,
    pub fused_moe: bool,
    pub allow_fixed: bool,
    pub report_base: Option<PathBuf>,
    pub unmount: bool,
    /// Take defaults instead of asking.
    pub assume_yes: bool,
}

pub struct App<'a> {
    pub store: &'a dyn ConfigStore,
    pub inventory: &'a dyn InventorySource,
    pub prompter: Prompter<'a>,
    pub spec: TargetCardSpec,
}

impl<'a> App<'a> {
    /// Top-level menu loop used when no subcommand is given.
    pub fn menu(&mut self) -> Result<()> {
        let options = ["System setup", "Run", "Exit"];
        loop {
            self.prompter.say("")?;
            self.prompter.say("RM-01 CFe-B card maker")?;
            match self.prompter.choose("Main menu", &options)? {
                0 => {
                    if let Err(err) = self.setup(None) {
                        self.prompter.say(format!("Setup failed: {:#}", err))?;
                    }
                }
                1 => {
                    if let Err(err) = self.run(&RunOptions::default()) {
                        self.prompter.say(format!("Run failed: {:#}", err))?;
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    pub fn setup(&mut self, disk: Option<PathBuf>) -> Result<Configuration> {
        let mut config = self.store.load()?;
        let disk = match disk {
            Some(disk) => disk,
            None => self.ask_master_path()?,
        };
        if !disk.exists() {
            bail!("path does not exist: {}", disk.display());
        }
        let models = scan_models(&disk)?;
        if models.is_empty() {
            bail!("no models found under {}", disk.join(MODELS_DIR).display());
        }
        for model in &models {
            self.prompter
                .say(format!("  found model: {} - {}", model.manufacturer, model.model_name))?;
        }
        config.disk_path = Some(disk);
        config.models = models;
        self.store.save(&config)?;
        info!(models = config.models.len(), "setup saved");
        self.prompter
            .say(format!("Settings saved, {} model(s) found", config.models.len()))?;
        Ok(config)
    }

    fn ask_master_path(&mut self) -> Result<PathBuf> {
        let inventory = self.inventory.snapshot()?;
        if let Ok(master) = find_master_disk(&inventory.devices) {
            if let Some(mount) = &master.mount_point {
                let question = format!("Master disk found on {} at {}. Use it?", master.node, mount);
                if self.prompter.confirm(&question)? {
                    return Ok(PathBuf::from(mount));
                }
            }
        }
        loop {
            let answer = self
                .prompter
                .line("Enter the master disk path (for example /media/RMinte_Models):")?;
            if answer.is_empty() {
                self.prompter.say("The path cannot be empty")?;
                continue;
            }
            let path = PathBuf::from(answer);
            if path.exists() {
                return Ok(path);
            }
            self.prompter.say(format!("Path does not exist: {}", path.display()))?;
        }
    }

    /// Reports how every device classifies.
    pub fn detect(&mut self) -> Result<()> {
        let inventory = self.inventory.snapshot()?;
        let master = find_master_disk(&inventory.devices);
        match &master {
            Ok(master) => self.prompter.say(format!(
                "master disk: {} ({}) at {}",
                master.device,
                master.node,
                master.location()
            ))?,
            Err(err) => self.prompter.say(format!("master disk: {}", err))?,
        }
        let excluded = master.as_ref().ok().map(|m| m.device.clone());
        for (device, verdict) in target_card_candidates(&inventory.devices, excluded.as_deref(), &self.spec) {
            let line = match verdict {
                Ok(card) => format!(
                    "{}: target card (rootfs={}, models={}, app={})",
                    device.name,
                    describe_mount(&card, CardRole::Rootfs),
                    describe_mount(&card, CardRole::Models),
                    describe_mount(&card, CardRole::App)
                ),
                Err(rejection) => format!("{}: {}", device.name, rejection),
            };
            self.prompter.say(line)?;
        }
        Ok(())
    }

    /// Lists the models recorded by the last setup.
    pub fn models(&mut self, manufacturer: Option<&str>) -> Result<()> {
        let config = self.store.load()?;
        if !config.is_set_up() {
            bail!("system setup has not been done; run `rmcard setup` first");
        }
        let models: Vec<&ModelEntry> = match manufacturer {
            Some(manufacturer) => filter_by_manufacturer(&config.models, manufacturer),
            None => config.models.iter().collect(),
        };
        if models.is_empty() {
            self.prompter.say("No models")?;
        }
        for model in models {
            self.prompter.say(format!(
                "{}\t{}\t{}",
                model.manufacturer, model.model_name, model.full_name
            ))?;
        }
        Ok(())
    }

    /// Shows which backend a model resolves to.
    pub fn backend(&mut self, model_name: &str, manifest: Option<PathBuf>) -> Result<()> {
        let paths = match manifest {
            Some(path) => vec![path],
            None => {
                let config = self.store.load()?;
                let master_root = config
                    .disk_path
                    .ok_or_else(|| anyhow!("no master disk configured; pass --manifest or run setup"))?;
                let inventory = self.inventory.snapshot()?;
                let excluded = master_device(&inventory, &master_root)
                    .unwrap_or_else(|| master_root.display().to_string());
                let card = find_unique_target_card(&inventory.devices, Some(&excluded), &self.spec).ok();
                let models_mount = card
                    .as_ref()
                    .and_then(|card| card.mount_point(CardRole::Models))
                    .map(Path::new);
                manifest_locations(&master_root, models_mount)
            }
        };
        let detected = auto_detect_backend(model_name, &paths);
        let source = match &detected.manifest {
            Some(path) => path.display().to_string(),
            None => "default".to_string(),
        };
        self.prompter
            .say(format!("{}: {} ({})", model_name, detected.name, source))?;
        Ok(())
    }

    pub fn run(&mut self, options: &RunOptions) -> Result<()> {
        let mut config = self.store.load()?;
        if !config.is_set_up() {
            bail!("system setup has not been done; run `rmcard setup` first");
        }
        let master_root = config
            .disk_path
            .clone()
            .ok_or_else(|| anyhow!("master disk path missing from configuration"))?;

        let inventory = self.inventory.snapshot()?;
        let master_device = master_device(&inventory, &master_root);
        let excluded = master_device
            .clone()
            .unwrap_or_else(|| master_root.display().to_string());
        let card = self.pick_target(&inventory, &excluded, options.assume_yes)?;
        self.prompter.say(format!("Target card: {}", card.device))?;

        let backend = match options.backend {
            Some(choice) => choice,
            None if options.assume_yes => BackendChoice::Auto,
            None => self.ask_backend()?,
        };
        let model = self.pick_model(&config.models, options)?;
        let vram = self.pick_vram(options)?;
        let fused_moe = match vram {
            None if options.fused_moe => bail!("--fused-moe needs --vram"),
            None => false,
            Some(_) if options.fused_moe => true,
            Some(_) if options.assume_yes => false,
            Some(_) => self
                .prompter
                .confirm("Add model optimisation and inference acceleration configs (fused MoE)?")?,
        };

        if !options.assume_yes {
            let question = format!(
                "Write {} to {} ({})?",
                model.full_name,
                card.device,
                describe_mount(&card, CardRole::Models)
            );
            if !self.prompter.confirm(&question)? {
                self.prompter.say("Cancelled")?;
                return Ok(());
            }
        }
        if config.target_card.as_deref() != Some(card.device.as_str()) {
            config.target_card = Some(card.device.clone());
            self.store.save(&config)?;
        }

        let plan = ProvisionPlan {
            master_root,
            master_device,
            card: card.clone(),
            model,
            backend,
            vram,
            fused_moe,
            safety: SafetyContext {
                allow_non_removable: options.allow_fixed,
            },
            report_base: options.report_base.clone(),
        };
        let outcome = run_provision(&plan, &inventory, &mut TerminalProgress::default())?;

        let backend_source = match (&backend, &outcome.backend_manifest) {
            (BackendChoice::Manual(_), _) => "chosen".to_string(),
            (BackendChoice::Auto, Some(path)) => format!("detected from {}", path.display()),
            (BackendChoice::Auto, None) => "default, no manifest match".to_string(),
        };
        self.prompter
            .say(format!("Backend: {} ({})", outcome.backend, backend_source))?;
        for step in &outcome.steps {
            let line = match &step.status {
                StepStatus::Completed { files, bytes } => {
                    format!("✓ {}: {} file(s), {} bytes", step.step, files, bytes)
                }
                StepStatus::Partial { copied, warnings, .. } => {
                    format!("⚠ {}: {} copied, {} warning(s)", step.step, copied, warnings)
                }
                StepStatus::Failed { reason } => format!("✗ {}: {}", step.step, reason),
            };
            self.prompter.say(line)?;
        }
        if let Some(report) = &outcome.report {
            self.prompter.say(format!("Report: {}", report.root.display()))?;
        }
        self.prompter.say("Card provisioning finished")?;

        let unmount = options.unmount
            || (!options.assume_yes && self.prompter.confirm("Unmount the card now?")?);
        if unmount {
            self.unmount(Some(&card.device))?;
        }
        Ok(())
    }

    fn pick_target(
        &mut self,
        inventory: &DeviceInventory,
        excluded: &str,
        assume_yes: bool,
    ) -> Result<TargetCard> {
        match find_unique_target_card(&inventory.devices, Some(excluded), &self.spec) {
            Ok(card) => Ok(card),
            Err(DiscoveryError::AmbiguousTarget { candidates }) if !assume_yes => {
                warn!(?candidates, "several target cards attached, asking");
                let idx = self.prompter.choose("Several cards found, pick the target", &candidates)?;
                let chosen: Vec<_> = inventory
                    .devices
                    .iter()
                    .filter(|device| device.name == candidates[idx])
                    .cloned()
                    .collect();
                Ok(find_unique_target_card(&chosen, Some(excluded), &self.spec)?)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn ask_backend(&mut self) -> Result<BackendChoice> {
        let options = [
            Backend::FlashAttention.name(),
            Backend::FlashInfer.name(),
            "Not sure, detect automatically",
        ];
        Ok(match self.prompter.choose("Backend", &options)? {
            0 => BackendChoice::Manual(Backend::FlashAttention),
            1 => BackendChoice::Manual(Backend::FlashInfer),
            _ => BackendChoice::Auto,
        })
    }

    fn pick_model(&mut self, models: &[ModelEntry], options: &RunOptions) -> Result<ModelEntry> {
        if let Some(name) = &options.model {
            return models
                .iter()
                .find(|model| &model.full_name == name)
                .or_else(|| models.iter().find(|model| &model.model_name == name))
                .cloned()
                .ok_or_else(|| anyhow!("model {} is not in the last scan; run setup again", name));
        }
        if options.assume_yes {
            bail!("--model is required with --yes");
        }
        let manufacturer = match &options.manufacturer {
            Some(manufacturer) => manufacturer.clone(),
            None => {
                let choices = manufacturer_choices();
                let idx = self.prompter.choose("Model manufacturer", &choices)?;
                choices[idx].to_string()
            }
        };
        let filtered = filter_by_manufacturer(models, &manufacturer);
        if filtered.is_empty() {
            bail!("no models from {}", manufacturer);
        }
        let labels: Vec<_> = filtered
            .iter()
            .map(|model| format!("{} - {}", model.manufacturer, model.model_name))
            .collect();
        let idx = self.prompter.choose("Model", &labels)?;
        Ok(filtered[idx].clone())
    }

    fn pick_vram(&mut self, options: &RunOptions) -> Result<Option<Vram>> {
        if options.vram.is_some() || options.skip_dev_config || options.assume_yes {
            return Ok(options.vram.filter(|_| !options.skip_dev_config));
        }
        if !self.prompter.confirm("Generate dev-mode model launch configs?")? {
            return Ok(None);
        }
        let labels: Vec<_> = Vram::ALL.iter().map(|vram| vram.as_str()).collect();
        let idx = self.prompter.choose("VRAM size", &labels)?;
        Ok(Some(Vram::ALL[idx]))
    }

    /// Unmounts the named card, or the one remembered in the configuration.
    pub fn unmount(&mut self, device: Option<&str>) -> Result<()> {
        let config = self.store.load()?;
        let name = device
            .map(str::to_string)
            .or(config.target_card)
            .ok_or_else(|| anyhow!("no target card known; run detection first"))?;
        let inventory = self.inventory.snapshot()?;
        let device = inventory
            .device(&name)
            .ok_or_else(|| anyhow!("device {} is not attached", name))?;
        let outcomes = unmount_partitions(device);
        if outcomes.is_empty() {
            self.prompter.say("Nothing to unmount")?;
        }
        for outcome in outcomes {
            match outcome.result {
                Ok(()) => self.prompter.say(format!("✓ unmounted {}", outcome.node))?,
                Err(reason) => self
                    .prompter
                    .say(format!("⚠ could not unmount {}: {}", outcome.node, reason))?,
            }
        }
        Ok(())
    }
}

fn master_device(inventory: &DeviceInventory, master_root: &Path) -> Option<String> {
    let root = master_root.display().to_string();
    inventory
        .devices
        .iter()
        .find(|device| device.is_identified_by(&root))
        .map(|device| device.name.clone())
        .or_else(|| find_master_disk(&inventory.devices).ok().map(|m| m.device))
}

fn describe_mount(card: &TargetCard, role: CardRole) -> String {
    let partition = card.partition(role);
    match &partition.mount_point {
        Some(mount) => format!("{} at {}", partition.node, mount),
        None => format!("{} not mounted", partition.node),
    }
}
