//! Resolution of pending ad tag redirects for an ad break.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::ad_break::{AdBreak, AdPath, PendingRedirect};
use crate::error::{Result, VastError};
use crate::fetch::AdTagFetcher;
use crate::parser::parse_vast;

pub const DEFAULT_MAX_REDIRECTS: usize = 4;

/// Identity of a redirect: which break, and where in it
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RedirectId {
    pub break_id: String,
    pub path: AdPath,
}

/// Result of resolving a break's redirects
#[derive(Debug)]
pub enum LoadOutcome {
    /// Every redirect under the claimed one was resolved
    Loaded(AdBreak),
    /// Resolution stopped. The break carries whatever was resolved, with
    /// the failing redirect dropped.
    Failed { ad_break: AdBreak, error: VastError },
}

impl LoadOutcome {
    pub fn ad_break(&self) -> &AdBreak {
        match self {
            LoadOutcome::Loaded(ad_break) => ad_break,
            LoadOutcome::Failed { ad_break, .. } => ad_break,
        }
    }
}

/// Fetches and parses follow-on VAST documents for a break.
///
/// Clones share the set of claimed redirects, so a redirect is only ever
/// fetched by one resolution at a time.
#[derive(Clone)]
pub struct AdBreakLoader {
    fetcher: Arc<dyn AdTagFetcher>,
    claimed: Arc<DashSet<RedirectId>>,
    max_redirects: usize,
}

impl AdBreakLoader {
    pub fn new(fetcher: Arc<dyn AdTagFetcher>, max_redirects: usize) -> Self {
        Self {
            fetcher,
            claimed: Arc::new(DashSet::new()),
            max_redirects: max_redirects.max(1),
        }
    }

    pub fn max_redirects(&self) -> usize {
        self.max_redirects
    }

    /// Whether the break's next pending redirect is already being (or was) resolved
    pub fn is_claimed(&self, ad_break: &AdBreak) -> bool {
        ad_break.pending_redirect().is_some_and(|pending| {
            self.claimed.contains(&RedirectId {
                break_id: ad_break.id.clone(),
                path: pending.path,
            })
        })
    }

    /// Claim the break's next pending redirect. `None` when nothing is
    /// pending or someone else holds it.
    pub fn try_claim(&self, ad_break: &AdBreak) -> Option<PendingRedirect> {
        let pending = ad_break.pending_redirect()?;
        let id = RedirectId {
            break_id: ad_break.id.clone(),
            path: pending.path.clone(),
        };
        self.claimed.insert(id).then_some(pending)
    }

    /// Give up a claim whose resolution never delivered
    pub fn release(&self, id: &RedirectId) -> bool {
        self.claimed.remove(id).is_some()
    }

    /// Forget every claim
    pub fn release_all(&self) {
        self.claimed.clear();
    }

    /// Claim and resolve on a background task, handing the outcome to `on_done`.
    ///
    /// Returns `None` without spawning when there is nothing to claim. A
    /// cancelled resolution releases its claim so the redirect can be
    /// fetched again.
    pub fn load<F>(&self, ad_break: &AdBreak, timeout: Duration, token: CancellationToken, on_done: F) -> Option<JoinHandle<()>>
    where
        F: FnOnce(LoadOutcome) + Send + 'static,
    {
        let root = self.try_claim(ad_break)?;
        log::debug!("Resolving {} for ad break {}", root.uri, ad_break.id);

        let loader = self.clone();
        let ad_break = ad_break.clone();
        let id = RedirectId {
            break_id: ad_break.id.clone(),
            path: root.path.clone(),
        };
        Some(tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    log::debug!("Resolution of ad break {} cancelled", ad_break.id);
                    loader.release(&id);
                }
                outcome = loader.resolve_claimed(ad_break.clone(), root, timeout) => on_done(outcome),
            }
        }))
    }

    /// Claim and resolve in place of the caller. `None` when there is
    /// nothing to claim.
    pub async fn resolve(&self, ad_break: AdBreak, timeout: Duration) -> Option<LoadOutcome> {
        let root = self.try_claim(&ad_break)?;
        Some(self.resolve_claimed(ad_break, root, timeout).await)
    }

    async fn resolve_claimed(&self, mut ad_break: AdBreak, root: PendingRedirect, timeout: Duration) -> LoadOutcome {
        let result = match tokio::time::timeout(timeout, self.resolve_chain(&mut ad_break, &root)).await {
            Ok(result) => result,
            Err(_) => {
                log::warn!("Ad break {} timed out after {:?}", ad_break.id, timeout);
                if let Err(e) = ad_break.apply_redirect(&root.path, None) {
                    log::warn!("Could not drop timed out redirect: {}", e);
                }
                Err(VastError::LoadTimeout(timeout))
            }
        };
        ad_break.refresh_ads(None);

        match result {
            Ok(()) if ad_break.total_ads() == 0 => LoadOutcome::Failed {
                ad_break,
                error: VastError::EmptyResponse,
            },
            Ok(()) => LoadOutcome::Loaded(ad_break),
            Err(error) => LoadOutcome::Failed { ad_break, error },
        }
    }

    /// Follow redirects depth first until nothing under `root` is pending
    async fn resolve_chain(&self, ad_break: &mut AdBreak, root: &PendingRedirect) -> Result<()> {
        let mut current = root.clone();

        loop {
            let depth = current.path.depth() - root.path.depth() + 1;
            let step = if depth > self.max_redirects {
                Err(VastError::TooManyRedirects(self.max_redirects))
            } else {
                self.follow(ad_break, &current).await
            };

            let next = match step {
                Ok(()) => match ad_break.pending_redirect_within(&root.path) {
                    Some(next) => next,
                    None => return Ok(()),
                },
                Err(err) => {
                    log::warn!("Redirect {} of ad break {} failed: {}", current.uri, ad_break.id, err);
                    let fallback = ad_break.falls_back_on_no_ad(&current.path);
                    ad_break.apply_redirect(&current.path, None)?;
                    match ad_break.pending_redirect_within(&root.path) {
                        Some(next) if fallback => next,
                        _ => return Err(err),
                    }
                }
            };
            current = next;
        }
    }

    async fn follow(&self, ad_break: &mut AdBreak, host: &PendingRedirect) -> Result<()> {
        let body = self.fetcher.fetch(&host.uri).await?;
        let vast = parse_vast(&body)?;
        log::debug!("Redirect {} returned {} ads", host.uri, vast.ads.len());
        ad_break.apply_redirect(&host.path, Some(vast))?;
        ad_break.refresh_ads(None);
        Ok(())
    }
}
