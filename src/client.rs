//! Demo client: negotiate one resource set and print its events.
//!
//! Runs until Ctrl-C, then releases and waits briefly for the
//! confirmation before returning.

use std::collections::BTreeSet;
use std::time::Duration;

use resource_policy::{
    AcquireState, Resource, ResourceError, ResourceEvent, ResourceSet, ResourceType,
};

use crate::cli::AcquireArgs;

/// How long to wait for the release confirmation on exit.
const RELEASE_TIMEOUT: Duration = Duration::from_secs(1);

/// Client error type.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Resource(#[from] ResourceError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Run the acquire command. Called from `main.rs` for `Command::Acquire`.
pub async fn run(args: AcquireArgs) -> Result<(), ClientError> {
    let mut set = build_set(args)?;
    set.acquire()?;
    tracing::debug!(set_id = set.id(), "acquire requested");

    let mut ctrl_c = std::pin::pin!(tokio::signal::ctrl_c());
    loop {
        tokio::select! {
            event = set.next_event() => match event {
                Some(event) => println!("{}", describe(&event)),
                None => return Ok(()),
            },
            result = &mut ctrl_c => {
                result?;
                break;
            }
        }
    }

    set.release()?;
    if set.acquire_state() != (AcquireState::ReleasePending { was_held: true }) {
        return Ok(());
    }
    let confirmed = tokio::time::timeout(RELEASE_TIMEOUT, async {
        while let Some(event) = set.next_event().await {
            println!("{}", describe(&event));
            if event == ResourceEvent::ResourcesReleased {
                break;
            }
        }
    })
    .await;
    if confirmed.is_err() {
        tracing::warn!(set_id = set.id(), "no release confirmation");
    }
    Ok(())
}

fn build_set(args: AcquireArgs) -> Result<ResourceSet, ResourceError> {
    let mut set = ResourceSet::with_flags(args.class, args.auto_release, args.always_reply);
    let pid = std::process::id();
    let required = args.resources.into_iter().map(|kind| (kind, false));
    let optional = args.optional.into_iter().map(|kind| (kind, true));
    for (kind, optional) in required.chain(optional) {
        let mut resource = Resource::new(kind).optional(optional);
        if let Some(audio) = resource.audio_mut() {
            audio.set_process_id(pid);
        }
        set.add_resource_object(resource)?;
    }
    Ok(set)
}

/// One output line per event.
fn describe(event: &ResourceEvent) -> String {
    let list = |kinds: &BTreeSet<ResourceType>| {
        kinds
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    };
    match event {
        ResourceEvent::ManagerIsUp => "manager is up".into(),
        ResourceEvent::ResourcesGranted(kinds) => format!("granted: {}", list(kinds)),
        ResourceEvent::ResourcesDenied => "denied".into(),
        ResourceEvent::ResourcesReleased => "released".into(),
        ResourceEvent::ResourcesBecameAvailable(kinds) => format!("available: {}", list(kinds)),
        ResourceEvent::LostResources => "lost".into(),
        ResourceEvent::ResourcesReleasedByManager => "released by manager".into(),
        ResourceEvent::UpdateOk => "update ok".into(),
        ResourceEvent::Error { code, message } => format!("error {code}: {message}"),
        ResourceEvent::PropertiesChanged(kind) => format!("properties changed: {kind}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(resources: Vec<ResourceType>, optional: Vec<ResourceType>) -> AcquireArgs {
        AcquireArgs {
            class: "player".into(),
            optional,
            resources,
            auto_release: true,
            always_reply: false,
        }
    }

    #[test]
    fn build_set_marks_optional_members() {
        let set = build_set(args(
            vec![ResourceType::AudioPlayback],
            vec![ResourceType::Vibra],
        ))
        .unwrap();

        assert_eq!(set.application_class(), "player");
        assert!(set.will_auto_release());
        assert!(!set.always_get_reply());
        assert!(!set.resource(ResourceType::AudioPlayback).unwrap().is_optional());
        assert!(set.resource(ResourceType::Vibra).unwrap().is_optional());
    }

    #[test]
    fn build_set_tags_audio_with_pid() {
        let set = build_set(args(vec![ResourceType::AudioRecorder], vec![])).unwrap();
        let audio = set.resource(ResourceType::AudioRecorder).unwrap();
        assert_eq!(audio.process_id(), Some(std::process::id()));
    }

    #[test]
    fn describe_lists_granted_types() {
        let event = ResourceEvent::ResourcesGranted(
            [ResourceType::AudioPlayback, ResourceType::Leds].into(),
        );
        assert_eq!(describe(&event), "granted: audio-playback, leds");
    }

    #[test]
    fn describe_error() {
        let event = ResourceEvent::Error {
            code: 2,
            message: "not registered".into(),
        };
        assert_eq!(describe(&event), "error 2: not registered");
    }
}
