use crate::control::ControlTables;
use crate::userplane::{
    Metering, NextHopTable, ResolutionFabric, SharedTables, SponsoredDomains, Worker, dump_stats,
    run_dns_consumer,
};
use crate::{Config, PacketBuf};
use anyhow::{Context, Result, ensure};
use async_channel::Receiver;
use async_std::task::{self, JoinHandle};
use slog::{Logger, info, o};
use std::sync::Arc;
use std::time::Duration;

const STATS_INTERVAL: Duration = Duration::from_secs(5);

pub struct Dataplane {
    config: Config,
    control: Arc<ControlTables>,
    fabric: Arc<ResolutionFabric>,
    sponsored_domains: Arc<SponsoredDomains>,
    workers: Vec<Arc<Worker>>,
    dns_rx: Receiver<PacketBuf>,
    tasks: Vec<JoinHandle<()>>,
    logger: Logger,
}

impl Dataplane {
    /// Create and start the dataplane: the background DNS consumer and stats tasks
    /// are running on return.
    pub async fn start(
        config: Config,
        metering: Option<Arc<dyn Metering>>,
        logger: Logger,
    ) -> Result<Self> {
        let mut dp = Self::new(config, metering, logger)?;
        dp.run();
        Ok(dp)
    }

    /// Create the dataplane without starting any background task.  Everything that
    /// must exist before the first packet is built here, in order: the fabric, the
    /// control tables, then the sponsored domain list, which shares its ADC rules with
    /// the control tables.  Any failure is fatal.
    pub fn new(
        config: Config,
        metering: Option<Arc<dyn Metering>>,
        logger: Logger,
    ) -> Result<Self> {
        ensure!(config.workers > 0, "At least one worker is needed");
        ensure!(config.dns_ring_depth > 0, "DNS ring depth must be non-zero");
        let capabilities = config.capabilities;
        ensure!(
            metering.is_some() || !(capabilities.sdf_metering || capabilities.apn_metering),
            "Metering is enabled but no metering algorithm was supplied"
        );

        let fabric = Arc::new(ResolutionFabric::create(&config.capacities, &logger)?);

        let control = Arc::new(ControlTables::new(fabric.clone(), &logger));
        control.init_session_table();
        control.init_meter_table(&config.meters)?;
        let filters = control.init_filter_table(&config)?;
        control.init_pcc_table(&filters);
        control.init_adc_table(&config.dns_servers, &config.sponsored_domains)?;

        let sponsored_domains = Arc::new(
            SponsoredDomains::create(
                config.capacities.sponsored_domains,
                &config.sponsored_domains,
                |rule_id| control.adc_rule(rule_id),
            )
            .context("Sponsored domain allocation failed")?,
        );

        let tables = SharedTables {
            filters: Arc::new(filters),
            fabric: fabric.clone(),
            next_hops: Arc::new(NextHopTable::new(&config.ports)?),
        };
        let (dns_tx, dns_rx) = async_channel::bounded(config.dns_ring_depth);
        let workers = (0..config.workers)
            .map(|id| {
                Arc::new(Worker::new(
                    id,
                    &config,
                    tables.clone(),
                    metering.clone(),
                    dns_tx.clone(),
                    &logger,
                ))
            })
            .collect();

        info!(
            logger,
            "Dataplane ready: S1-U {} port {}, SGi port {}, {} workers, ADC {}",
            config.s1u_ip,
            config.s1u_port,
            config.sgi_port,
            config.workers,
            if capabilities.adc { "on" } else { "off" }
        );

        Ok(Dataplane {
            config,
            control,
            fabric,
            sponsored_domains,
            workers,
            dns_rx,
            tasks: vec![],
            logger,
        })
    }

    fn run(&mut self) {
        self.tasks.push(task::spawn(run_dns_consumer(
            self.dns_rx.clone(),
            self.sponsored_domains.clone(),
            self.fabric.clone(),
            self.logger.new(o!("task" => "dns")),
        )));
        self.tasks.push(task::spawn(dump_stats(
            self.logger.clone(),
            self.workers.clone(),
            STATS_INTERVAL,
        )));
    }

    pub async fn graceful_shutdown(self) {
        info!(&self.logger, "Shutting down");
        self.dns_rx.close();
        for t in self.tasks {
            t.cancel().await;
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
    pub fn control(&self) -> &ControlTables {
        &self.control
    }
    pub fn fabric(&self) -> &ResolutionFabric {
        &self.fabric
    }
    pub fn worker(&self, id: usize) -> Option<&Arc<Worker>> {
        self.workers.get(id)
    }
    pub fn workers(&self) -> &[Arc<Worker>] {
        &self.workers
    }
}
