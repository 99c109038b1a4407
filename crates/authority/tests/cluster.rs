mod common;

use std::sync::Arc;
use std::time::Duration;

use authority::Kernel;
use policy::{ConstraintSet, Operation, ResourceType};
use revocation::{Cluster, LocalCluster};

#[tokio::test]
async fn revocation_reaches_peer_nodes() {
    let cluster: Arc<dyn Cluster> = Arc::new(LocalCluster::new());
    let keys = common::keys();
    let origin = Kernel::start_with_keys(common::config(), Arc::clone(&cluster), Arc::clone(&keys))
        .await
        .unwrap();
    let peer = Kernel::start_with_keys(common::config(), Arc::clone(&cluster), keys)
        .await
        .unwrap();
    assert_ne!(origin.node_id(), peer.node_id());
    assert_eq!(origin.revocations().get_stats().cluster_members, 2);

    let cap = origin
        .authority()
        .request_capability(
            ResourceType::Filesystem,
            ConstraintSet::new().with_paths(["/srv/**"]).with_operations(["read"]),
            "agent",
        )
        .await
        .unwrap();
    let token = origin.authority().export_token(&cap).unwrap().token;

    let read = Operation::read();
    assert!(peer.tokens().validate_token(&token, &read, "/srv/a").is_ok());

    origin.authority().revoke_capability(&cap, "compromised").await.unwrap();

    let propagated = tokio::time::timeout(Duration::from_secs(5), async {
        while peer.tokens().validate_token(&token, &read, "/srv/a").is_ok() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(propagated.is_ok(), "revocation never reached the peer");
    assert_eq!(
        peer.tokens().validate_token(&token, &read, "/srv/a").unwrap_err().reason(),
        "token_revoked"
    );
    assert!(peer.revocations().is_revoked(cap.id.as_str()));
}
