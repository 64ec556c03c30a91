//! JBIG2 encoding and batch coordination.
//!
//! ## Why batching exists
//!
//! In symbol mode the encoder builds one symbol dictionary over *all* input
//! images of an invocation; masks that should share a dictionary must
//! therefore be encoded together, in one run, no matter which page asked
//! first. The [`Jbig2Coordinator`] makes that rendezvous: the first caller
//! for an unclaimed node claims every node with the same batching key while
//! holding a short lock, installs a pending slot per member, then runs the
//! encoder outside the lock. Later callers find their node claimed and wait
//! on its slot. Lossless (threshold 1) masks and builds with dictionary
//! sharing disabled skip the rendezvous; each is its own singleton batch.
//!
//! Failure is all-or-nothing: when the batched invocation fails, every
//! member slot reports the same error and the claims are dropped so a later
//! caller can try again.

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use futures::future::try_join_all;
use lopdf::{dictionary, Object, Stream};
use tokio::sync::oneshot;
use tracing::debug;

use crate::config::BuildOptions;
use crate::error::BuildError;
use crate::exec::{lock, CommandRunner};
use crate::graph::{BuildGraph, Jbig2Params, NodeId};
use crate::magick::bitonal_png_argv;
use crate::pdf::content::format_number;
use crate::pdf::bundle::{BundleBuilder, PdfObjectBundle};

type ArtifactResult = Result<Arc<PdfObjectBundle>, Arc<BuildError>>;

enum ClaimSlot {
    /// A batch containing this node is running; senders are fulfilled when
    /// it lands.
    Claimed(Vec<oneshot::Sender<ArtifactResult>>),
    Fulfilled(Arc<PdfObjectBundle>),
}

/// Claim table for symbol-dictionary batches. One per build.
pub(crate) struct Jbig2Coordinator {
    claims: Mutex<HashMap<NodeId, ClaimSlot>>,
}

impl Jbig2Coordinator {
    pub fn new() -> Jbig2Coordinator {
        Jbig2Coordinator {
            claims: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve the encoded artifact for `node`, claiming and running its
    /// batch if nobody else has.
    pub async fn encode(
        &self,
        graph: &BuildGraph,
        node: NodeId,
        params: &Jbig2Params,
        runner: &CommandRunner,
        options: &BuildOptions,
    ) -> Result<Arc<PdfObjectBundle>, BuildError> {
        enum Role {
            Lead(Vec<(NodeId, Jbig2Params)>),
            Wait(oneshot::Receiver<ArtifactResult>),
        }
        loop {
            let role = {
                let mut claims = lock(&self.claims);
                match claims.get_mut(&node) {
                    Some(ClaimSlot::Fulfilled(artifact)) => return Ok(Arc::clone(artifact)),
                    Some(ClaimSlot::Claimed(waiters)) => {
                        let (sender, receiver) = oneshot::channel();
                        waiters.push(sender);
                        Role::Wait(receiver)
                    }
                    None => Role::Lead(claim_batch(&mut claims, graph, node, params, options)),
                }
            };
            match role {
                Role::Wait(receiver) => match receiver.await {
                    Ok(Ok(artifact)) => return Ok(artifact),
                    Ok(Err(shared)) => return Err(BuildError::shared(shared)),
                    // The claiming task was dropped before fulfilling;
                    // claim the batch ourselves on the next pass.
                    Err(_) => continue,
                },
                Role::Lead(members) => {
                    return self.run_batch(node, members, params, runner, options).await
                }
            }
        }
    }

    async fn run_batch(
        &self,
        node: NodeId,
        members: Vec<(NodeId, Jbig2Params)>,
        params: &Jbig2Params,
        runner: &CommandRunner,
        options: &BuildOptions,
    ) -> Result<Arc<PdfObjectBundle>, BuildError> {
        let mut guard = ClaimGuard {
            coordinator: self,
            members: &members,
            armed: true,
        };
        let outcome = encode_batch(&members, params, runner, options).await;
        guard.armed = false;

        let mut claims = lock(&self.claims);
        match outcome {
            Ok(artifacts) => {
                let mut mine = None;
                for ((id, _), artifact) in members.iter().zip(artifacts) {
                    if *id == node {
                        mine = Some(Arc::clone(&artifact));
                    }
                    let previous = claims.insert(*id, ClaimSlot::Fulfilled(Arc::clone(&artifact)));
                    if let Some(ClaimSlot::Claimed(waiters)) = previous {
                        for waiter in waiters {
                            let _ = waiter.send(Ok(Arc::clone(&artifact)));
                        }
                    }
                }
                Ok(mine.expect("the claiming node is a member of its own batch"))
            }
            Err(err) => {
                let shared = Arc::new(err);
                for (id, _) in &members {
                    if let Some(ClaimSlot::Claimed(waiters)) = claims.remove(id) {
                        for waiter in waiters {
                            let _ = waiter.send(Err(Arc::clone(&shared)));
                        }
                    }
                }
                Err(BuildError::shared(shared))
            }
        }
    }
}

/// Drops a batch's claims when its runner is cancelled mid-flight, so the
/// nodes become claimable again. Waiters see their senders close and retry.
struct ClaimGuard<'a> {
    coordinator: &'a Jbig2Coordinator,
    members: &'a [(NodeId, Jbig2Params)],
    armed: bool,
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut claims = lock(&self.coordinator.claims);
        for (id, _) in self.members {
            claims.remove(id);
        }
    }
}

/// Finalize batch membership. Caller holds the claim lock; every returned
/// node gets a pending slot before the lock is released.
fn claim_batch(
    claims: &mut HashMap<NodeId, ClaimSlot>,
    graph: &BuildGraph,
    node: NodeId,
    params: &Jbig2Params,
    options: &BuildOptions,
) -> Vec<(NodeId, Jbig2Params)> {
    let mut members = Vec::new();
    if params.is_lossless() || !options.shared_symbol_dictionaries {
        members.push((node, params.clone()));
    } else {
        for (id, candidate) in graph.jbig2_nodes() {
            if candidate.batch_key() == params.batch_key() && !claims.contains_key(&id) {
                members.push((id, candidate.clone()));
            }
        }
    }
    for (id, _) in &members {
        claims.insert(*id, ClaimSlot::Claimed(Vec::new()));
    }
    members
}

fn jbig2_argv(command: &str, params: &Jbig2Params, inputs: &[PathBuf]) -> Vec<OsString> {
    let mut argv: Vec<OsString> = vec![command.into(), "-p".into()];
    if !params.is_lossless() {
        argv.push("-s".into());
        argv.push("-t".into());
        argv.push(format_number(params.threshold(), 4, false).into());
    }
    for input in inputs {
        argv.push(input.clone().into_os_string());
    }
    argv
}

/// Run one batch: pre-convert every member to bitonal PNG in parallel, then
/// one encoder invocation over all of them, then split the outputs.
async fn encode_batch(
    members: &[(NodeId, Jbig2Params)],
    params: &Jbig2Params,
    runner: &CommandRunner,
    options: &BuildOptions,
) -> Result<Vec<Arc<PdfObjectBundle>>, BuildError> {
    let scratch = options.scratch_tempdir()?;
    let symbol_mode = !params.is_lossless();

    let inputs: Vec<PathBuf> = (0..members.len())
        .map(|i| scratch.path().join(format!("input.{i}.png")))
        .collect();
    let mut preconversions = Vec::with_capacity(members.len());
    for ((_, member), input) in members.iter().zip(&inputs) {
        let argv = bitonal_png_argv(&options.convert_command, &member.path, input)?;
        preconversions.push(async move { runner.run(&argv, None).await });
    }
    try_join_all(preconversions).await?;

    debug!(
        members = members.len(),
        symbol_mode, "running jbig2 encoder"
    );
    let argv = jbig2_argv(&options.jbig2_command, params, &inputs);
    // The encoder writes its outputs relative to the working directory.
    let stdout = runner.run(&argv, Some(scratch.path())).await?;

    let globals = if symbol_mode {
        let path = scratch.path().join("output.sym");
        let data = tokio::fs::read(&path)
            .await
            .map_err(|err| BuildError::io(path, err))?;
        let mut builder = BundleBuilder::new();
        let root = builder.add(Object::Stream(
            Stream::new(dictionary! {}, data).with_compression(false),
        ));
        Some(Arc::new(builder.finish(root)))
    } else {
        None
    };

    let mut outputs: Vec<Vec<u8>> = Vec::with_capacity(members.len());
    if symbol_mode {
        for i in 0..members.len() {
            let path = scratch.path().join(format!("output.{i:04}"));
            let data = tokio::fs::read(&path)
                .await
                .map_err(|err| BuildError::io(path, err))?;
            outputs.push(data);
        }
    } else {
        // Generic coding writes the single page stream to stdout.
        outputs.push(stdout);
    }

    outputs
        .into_iter()
        .map(|data| page_stream_bundle(data, globals.as_ref()))
        .collect()
}

/// Wrap one encoder page stream as an image-mask XObject bundle. Width and
/// height come from the page info segment the `-p` flag embeds.
fn page_stream_bundle(
    data: Vec<u8>,
    globals: Option<&Arc<PdfObjectBundle>>,
) -> Result<Arc<PdfObjectBundle>, BuildError> {
    let (width, height) = embedded_dimensions(&data)?;
    let mut builder = BundleBuilder::new();
    let mut dict = dictionary! {
        "Type" => "XObject",
        "Subtype" => "Image",
        "Width" => width as i64,
        "Height" => height as i64,
        "ImageMask" => true,
        "BitsPerComponent" => 1,
        "Filter" => vec![Object::Name(b"JBIG2Decode".to_vec())],
    };
    if let Some(globals) = globals {
        let link = builder.link(Arc::clone(globals));
        dict.set(
            "DecodeParms",
            vec![Object::Dictionary(dictionary! {
                "JBIG2Globals" => Object::Reference((link, 0)),
            })],
        );
    }
    let root = builder.add(Object::Stream(Stream::new(dict, data).with_compression(false)));
    Ok(Arc::new(builder.finish(root)))
}

/// Page width and height from the first page info segment: four big-endian
/// u32 fields (width, height, xres, yres) at byte 11.
fn embedded_dimensions(data: &[u8]) -> Result<(u32, u32), BuildError> {
    if data.len() < 27 {
        return Err(BuildError::BatchFailed {
            detail: format!(
                "encoder output is {} bytes, too short for a page info segment",
                data.len()
            ),
        });
    }
    let width = u32::from_be_bytes([data[11], data[12], data[13], data[14]]);
    let height = u32::from_be_bytes([data[15], data[16], data[17], data[18]]);
    Ok((width, height))
}
