use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{ArgGroup, Parser, Subcommand};
use panelsync_db::repositories::catalog_repo::CatalogRepository;
use panelsync_db::repositories::subscription_repo::SubscriptionRepository;
use panelsync_panel::{PanelClient, PanelGateway};
use serde_json::{Value, json};
use sqlx::PgPool;

use crate::config::AppConfig;
use crate::services::catalog_cache::{CatalogCache, PgCatalogSource};
use crate::services::pricing_service::{
    self, AddonRequest, DiscountProfile, PriceQuote, PurchaseRequest,
};
use crate::services::reconcile::AccountPolicy;
use crate::services::store::{PgSubscriptionStore, SubscriptionStore};
use crate::services::sync_service::{ProvisionOptions, SyncOptions, SyncReport, SyncService};

#[derive(Parser)]
#[command(name = "panelsync")]
#[command(about = "Keeps local subscriptions and VPN panel accounts in step", long_about = None)]
pub struct Cli {
    /// Config file. Without it the well-known paths and the environment are used.
    #[arg(long, short, global = true, env = "PANELSYNC_CONFIG")]
    pub config: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create or adopt the panel account of a subscription
    Provision {
        subscription_id: i64,
        /// Also reset remote traffic counters
        #[arg(long)]
        reset_traffic: bool,
    },
    /// Push the local subscription state to its panel account
    Resync { subscription_id: i64 },
    /// Provision or repair only when links are missing or stale
    Ensure { subscription_id: i64 },
    /// Drop the current linkage and provision again
    Repair { subscription_id: i64 },
    Enable { subscription_id: i64 },
    Disable { subscription_id: i64 },
    ResetTraffic {
        subscription_id: i64,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Rotate subscription links
    Revoke { subscription_id: i64 },
    /// Delete (or disable) the panel account and forget the linkage
    Remove { subscription_id: i64 },
    /// Copy used traffic from the panel
    SyncUsage { subscription_id: i64 },
    /// Print every panel account, one JSON object per line
    ListRemote,
    /// Price a new subscription for a user
    Quote {
        #[arg(long)]
        user: i64,
        #[arg(long)]
        days: i32,
        /// 0 is unlimited
        #[arg(long, default_value_t = 0)]
        traffic_gb: i32,
        #[arg(long, default_value_t = 1)]
        devices: i32,
        #[arg(long = "server-group")]
        server_groups: Vec<String>,
    },
    /// Price a renewal of an existing subscription
    QuoteRenewal {
        subscription_id: i64,
        #[arg(long)]
        days: i32,
    },
    /// Price one add-on for the rest of an active subscription
    #[command(group(
        ArgGroup::new("addon")
            .required(true)
            .args(["traffic_gb", "devices", "server_groups"])
    ))]
    QuoteAddon {
        subscription_id: i64,
        #[arg(long)]
        traffic_gb: Option<i32>,
        /// Devices on top of the current limit
        #[arg(long)]
        devices: Option<i32>,
        #[arg(long = "server-group")]
        server_groups: Vec<String>,
    },
}

type PgSyncService = SyncService<PanelClient, PgSubscriptionStore>;

fn sync_service(config: &AppConfig, pool: PgPool) -> PgSyncService {
    let gateway = config.panel_config().map(PanelClient::new);
    SyncService::new(
        gateway,
        PgSubscriptionStore::new(pool),
        AccountPolicy::from(&config.sync),
        SyncOptions::from(&config.sync).with_page_size(config.panel.page_size),
    )
}

pub async fn run(cli: Cli, config: AppConfig) -> Result<()> {
    let pool = panelsync_db::connect(&config.database_url).await?;

    match cli.command {
        Commands::ListRemote => {
            let sync = sync_service(&config, pool);
            for account in sync.list_remote_accounts().await? {
                println!(
                    "{}",
                    json!({
                        "uuid": account.uuid,
                        "username": account.username,
                        "status": account.status.as_str(),
                        "expire_at": account.expire_at,
                        "telegram_id": account.telegram_id,
                        "used_traffic_gb": account.used_traffic_gb(),
                    })
                );
            }
        }
        Commands::Quote {
            user,
            days,
            traffic_gb,
            devices,
            server_groups,
        } => {
            let request = PurchaseRequest {
                period_days: days,
                traffic_gb,
                server_groups,
                devices,
            };
            let (catalog, profile) = pricing_inputs(&config, pool, user).await?;
            let quote = pricing_service::quote_purchase(&catalog, &profile, &request)?;
            println!("{}", render_quote(&quote));
        }
        Commands::QuoteRenewal {
            subscription_id,
            days,
        } => {
            let subscription = SubscriptionRepository::new(pool.clone())
                .get_by_id(subscription_id)
                .await?
                .with_context(|| format!("Subscription {} not found", subscription_id))?;
            let (catalog, profile) = pricing_inputs(&config, pool, subscription.user_id).await?;
            let quote = pricing_service::quote_renewal(&catalog, &profile, &subscription, days)?;
            println!("{}", render_quote(&quote));
        }
        Commands::QuoteAddon {
            subscription_id,
            traffic_gb,
            devices,
            server_groups,
        } => {
            let subscription = SubscriptionRepository::new(pool.clone())
                .get_by_id(subscription_id)
                .await?
                .with_context(|| format!("Subscription {} not found", subscription_id))?;
            let request = match (traffic_gb, devices) {
                (Some(gb), _) => AddonRequest::Traffic { gb },
                (None, Some(additional)) => AddonRequest::Devices {
                    current: subscription.device_limit,
                    additional,
                },
                (None, None) => AddonRequest::Servers {
                    groups: server_groups,
                },
            };
            let (catalog, profile) = pricing_inputs(&config, pool, subscription.user_id).await?;
            let quote = pricing_service::quote_addon(
                &catalog,
                &profile,
                subscription.end_date,
                Utc::now(),
                &request,
            )?;
            println!("{}", render_quote(&quote));
        }
        command => {
            let sync = sync_service(&config, pool);
            let report = dispatch(&sync, command).await?;
            println!("{}", render_report(&report));
        }
    }

    Ok(())
}

async fn dispatch<G: PanelGateway, S: SubscriptionStore>(
    sync: &SyncService<G, S>,
    command: Commands,
) -> Result<SyncReport> {
    let report = match command {
        Commands::Provision {
            subscription_id,
            reset_traffic,
        } => {
            let options = ProvisionOptions {
                reset_traffic,
                reset_reason: reset_traffic.then(|| "provision".to_string()),
            };
            sync.provision_with(subscription_id, options).await?
        }
        Commands::Resync { subscription_id } => sync.resync(subscription_id).await?,
        Commands::Ensure { subscription_id } => sync.ensure_synced(subscription_id).await?,
        Commands::Repair { subscription_id } => sync.repair(subscription_id).await?,
        Commands::Enable { subscription_id } => sync.enable(subscription_id).await?,
        Commands::Disable { subscription_id } => sync.disable(subscription_id).await?,
        Commands::ResetTraffic {
            subscription_id,
            reason,
        } => sync.reset_traffic(subscription_id, reason.as_deref()).await?,
        Commands::Revoke { subscription_id } => sync.revoke_links(subscription_id).await?,
        Commands::Remove { subscription_id } => sync.remove(subscription_id).await?,
        Commands::SyncUsage { subscription_id } => sync.sync_usage(subscription_id).await?,
        Commands::ListRemote
        | Commands::Quote { .. }
        | Commands::QuoteRenewal { .. }
        | Commands::QuoteAddon { .. } => anyhow::bail!("not a sync command"),
    };
    Ok(report)
}

async fn pricing_inputs(
    config: &AppConfig,
    pool: PgPool,
    user_id: i64,
) -> Result<(std::sync::Arc<pricing_service::PriceCatalog>, DiscountProfile)> {
    let cache = CatalogCache::new(
        PgCatalogSource::new(pool.clone(), config.pricing.clone()),
        Duration::from_secs(config.pricing.catalog_ttl_secs),
    );
    let catalog = cache.get().await?;

    let repo = CatalogRepository::new(pool);
    let groups = repo.promo_groups_for_user(user_id).await?;
    let overrides = repo.discount_overrides(user_id).await?;
    let profile = DiscountProfile::new(
        groups,
        &overrides,
        pricing_service::parse_period_discounts(&config.pricing.base_period_discounts),
    );
    Ok((catalog, profile))
}

fn render_report(report: &SyncReport) -> String {
    let mut line = format!(
        "subscription={} action={:?}",
        report.subscription_id, report.action
    );
    if report.repaired {
        line.push_str(" repaired=true");
    }
    if let Some(uuid) = &report.panel_uuid {
        line.push_str(&format!(" panel_uuid={}", uuid));
    }
    if let Some(url) = &report.subscription_url {
        line.push_str(&format!(" url={}", url));
    }
    if !report.drifted_fields.is_empty() {
        line.push_str(&format!(" drifted={}", report.drifted_fields.join(",")));
    }
    if let Some(gb) = report.used_traffic_gb {
        line.push_str(&format!(" used_gb={:.2}", gb));
    }
    line
}

fn render_quote(quote: &PriceQuote) -> Value {
    let lines: Vec<Value> = quote
        .lines
        .iter()
        .map(|l| {
            json!({
                "category": l.category.as_str(),
                "label": l.label,
                "base": l.base,
                "percent": l.percent,
                "discount": l.discount,
                "total": l.total,
            })
        })
        .collect();
    json!({
        "months": quote.months,
        "total": quote.total,
        "discount": quote.discount_total(),
        "lines": lines,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncSettings;
    use crate::services::fakes::{FakePanel, MemoryStore};
    use crate::services::reconcile::tests::{subscription, user};
    use crate::services::store::SubscriptionContext;
    use crate::services::sync_service::SyncAction;

    #[test]
    fn parses_subcommands() {
        let cli = Cli::parse_from([
            "panelsync",
            "--config",
            "/tmp/panelsync.toml",
            "reset-traffic",
            "12",
            "--reason",
            "support",
        ]);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/panelsync.toml")));
        assert!(matches!(
            cli.command,
            Commands::ResetTraffic { subscription_id: 12, reason: Some(ref r) } if r == "support"
        ));

        let cli = Cli::parse_from([
            "panelsync",
            "quote",
            "--user",
            "3",
            "--days",
            "90",
            "--server-group",
            "eu",
            "--server-group",
            "us",
        ]);
        match cli.command {
            Commands::Quote {
                user,
                days,
                traffic_gb,
                devices,
                server_groups,
            } => {
                assert_eq!((user, days, traffic_gb, devices), (3, 90, 0, 1));
                assert_eq!(server_groups, vec!["eu", "us"]);
            }
            _ => panic!("expected quote"),
        }
    }

    #[test]
    fn report_renders_on_one_line() {
        let report = SyncReport {
            subscription_id: 4,
            action: SyncAction::Updated,
            repaired: true,
            panel_uuid: Some("u-1".into()),
            subscription_url: Some("https://sub.example.com/abc".into()),
            crypto_link: None,
            drifted_fields: vec!["status", "expire_at"],
            used_traffic_gb: None,
        };
        assert_eq!(
            render_report(&report),
            "subscription=4 action=Updated repaired=true panel_uuid=u-1 \
             url=https://sub.example.com/abc drifted=status,expire_at"
        );
    }

    #[test]
    fn parses_addon_quotes() {
        let cli = Cli::parse_from(["panelsync", "quote-addon", "8", "--traffic-gb", "100"]);
        assert!(matches!(
            cli.command,
            Commands::QuoteAddon {
                subscription_id: 8,
                traffic_gb: Some(100),
                devices: None,
                ref server_groups,
            } if server_groups.is_empty()
        ));

        let cli = Cli::parse_from([
            "panelsync",
            "quote-addon",
            "8",
            "--server-group",
            "eu",
            "--server-group",
            "asia",
        ]);
        match cli.command {
            Commands::QuoteAddon { server_groups, .. } => {
                assert_eq!(server_groups, vec!["eu", "asia"]);
            }
            _ => panic!("expected quote-addon"),
        }

        assert!(Cli::try_parse_from(["panelsync", "quote-addon", "8"]).is_err());
        assert!(
            Cli::try_parse_from([
                "panelsync",
                "quote-addon",
                "8",
                "--traffic-gb",
                "10",
                "--devices",
                "2",
            ])
            .is_err()
        );
    }

    #[tokio::test]
    async fn provision_with_reset_dispatches_to_the_engine() {
        let cli = Cli::parse_from(["panelsync", "provision", "1", "--reset-traffic"]);
        let settings = SyncSettings::default();
        let panel = FakePanel::default();
        let mut ctx = SubscriptionContext {
            subscription: subscription(1, 1, Utc::now() + chrono::Duration::days(30)),
            user: user(1, Some(42)),
            tariff: None,
        };
        ctx.subscription.traffic_used_gb = 3.0;
        let store = MemoryStore::with(ctx);
        let sync = SyncService::new(
            Ok(panel.clone()),
            store.clone(),
            AccountPolicy::from(&settings),
            SyncOptions::from(&settings),
        );

        let report = dispatch(&sync, cli.command).await.unwrap();

        assert_eq!(report.action, SyncAction::Created);
        assert_eq!(panel.calls("reset_traffic"), 1);
        let stored = store.get(1);
        assert_eq!(stored.user.panel_uuid.as_deref(), Some("uuid-1"));
        assert_eq!(stored.subscription.traffic_used_gb, 0.0);
    }
}
