//! Leader election tests: single-winner elections, failover and
//! partition behavior, and the one-vote-per-term safety argument.


use std::time::Duration;

use replog::proto::VoteRequest;
use replog::raft::rpc::handle_request_vote;
use replog::raft::RaftState;
use test_harness::{assert_eventually, TestCluster};

#[tokio::test]
async fn three_node_cluster_elects_single_leader() {
    let mut cluster = TestCluster::new(3, 53100).await;

    let leader_id = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("A leader should be elected within 5 seconds");

    assert_eq!(cluster.count_leaders().await, 1, "Exactly one leader");

    // Heartbeats propagate the leader's identity to every follower
    assert_eventually(
        || async {
            for node in cluster.nodes.values() {
                if node.leader_id().await.as_deref() != Some(leader_id.as_str()) {
                    return false;
                }
            }
            true
        },
        Duration::from_secs(2),
        "All nodes should agree on the leader",
    )
    .await;

    // And all nodes converge on the leader's term
    let leader_term = cluster.get_node(&leader_id).unwrap().current_term().await;
    assert_eventually(
        || async {
            for node in cluster.nodes.values() {
                if node.current_term().await != leader_term {
                    return false;
                }
            }
            true
        },
        Duration::from_secs(2),
        "All nodes should converge on the leader's term",
    )
    .await;

    cluster.shutdown().await;
}

#[tokio::test]
async fn five_node_cluster_elects_single_leader() {
    let mut cluster = TestCluster::new(5, 53110).await;

    cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("A leader should be elected within 5 seconds");

    assert_eq!(cluster.count_leaders().await, 1, "Exactly one leader");

    cluster.shutdown().await;
}

#[tokio::test]
async fn new_leader_elected_after_leader_crash() {
    let mut cluster = TestCluster::new(3, 53120).await;

    let initial_leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Initial leader should be elected");
    let initial_term = cluster
        .get_node(&initial_leader)
        .unwrap()
        .current_term()
        .await;

    assert!(cluster.shutdown_node(&initial_leader));

    let new_leader = cluster
        .wait_for_new_leader(&initial_leader, Duration::from_secs(5))
        .await
        .expect("New leader should be elected");

    assert_ne!(new_leader, initial_leader);

    // A fresh election round always opens a higher term
    let new_term = cluster.get_node(&new_leader).unwrap().current_term().await;
    assert!(new_term > initial_term, "Term should increase after failover");
    assert_eq!(cluster.count_leaders().await, 1);

    cluster.shutdown().await;
}

#[tokio::test]
async fn majority_side_elects_leader_during_partition() {
    let mut cluster = TestCluster::new(3, 53130).await;

    let leader_id = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");

    // Cut the leader off from both followers
    cluster.isolate_node(&leader_id).await;

    let majority: Vec<String> = cluster
        .active_node_ids()
        .into_iter()
        .filter(|id| id != &leader_id)
        .collect();
    let majority_refs: Vec<&str> = majority.iter().map(|s| s.as_str()).collect();

    let new_leader = cluster
        .wait_for_leader_in_group(&majority_refs, Duration::from_secs(5))
        .await
        .expect("Majority side should elect a leader");
    assert_ne!(new_leader, leader_id);

    // Heal: the deposed leader observes the higher term and steps down
    cluster.heal_node(&leader_id).await;
    assert_eventually(
        || async { cluster.count_leaders().await == 1 },
        Duration::from_secs(5),
        "Old leader should step down after the partition heals",
    )
    .await;

    cluster.shutdown().await;
}

// ---------------------------------------------------------------------------
// Election safety: at most one candidate can assemble a majority per term,
// because each node records its vote before granting and never grants twice.
// Exercised directly against the vote handler, with no timers involved.
// ---------------------------------------------------------------------------

fn competing_candidates_single_winner(n: usize) {
    let mut states: Vec<RaftState> = (0..n)
        .map(|i| RaftState::new(format!("node{}", i + 1)))
        .collect();

    // Nodes 0 and 1 both time out and campaign at term 1
    states[0].become_candidate();
    states[1].become_candidate();

    let majority = n / 2 + 1;
    let mut tallies = vec![1usize, 1usize]; // self-votes

    // Interleave the two candidates' vote requests across the remaining
    // voters: whoever reaches each voter first takes its single vote.
    for voter in 2..n {
        for candidate in 0..2 {
            let req = VoteRequest {
                term: 1,
                candidate_id: states[candidate].node_id.clone(),
            };
            let resp = handle_request_vote(&mut states[voter], &req);
            if resp.vote_granted {
                tallies[candidate] += 1;
            }
        }
    }

    let winners = tallies.iter().filter(|&&t| t >= majority).count();
    assert!(winners <= 1, "two candidates claimed a majority: {:?}", tallies);

    // Every voter granted at most one vote, and it stayed recorded
    for voter in &states[2..] {
        assert!(voter.voted_for.is_some());
    }
}

#[test]
fn election_safety_three_nodes() {
    competing_candidates_single_winner(3);
}

#[test]
fn election_safety_five_nodes() {
    competing_candidates_single_winner(5);
}

#[test]
fn all_nodes_campaigning_yields_no_winner() {
    // Everyone votes for itself; nobody can assemble a majority this term
    let n = 3;
    let mut states: Vec<RaftState> = (0..n)
        .map(|i| RaftState::new(format!("node{}", i + 1)))
        .collect();
    for state in &mut states {
        state.become_candidate();
    }

    let mut tallies = vec![1usize; n];
    for candidate in 0..n {
        for voter in 0..n {
            if voter == candidate {
                continue;
            }
            let req = VoteRequest {
                term: 1,
                candidate_id: states[candidate].node_id.clone(),
            };
            let resp = handle_request_vote(&mut states[voter], &req);
            if resp.vote_granted {
                tallies[candidate] += 1;
            }
        }
    }

    assert!(tallies.iter().all(|&t| t < n / 2 + 1), "{:?}", tallies);
}
