//! Monitor start-up and capacity polling against live nodes.

mod common;

use std::time::Duration;

use anyhow::Result;
use dist_subs::connector::SubscriberClient;
use dist_subs::frame::read_message;
use dist_subs::monitor::{self, MonitorOptions};
use dist_subs::node::NodeState;
use dist_subs::proto::{Capacity, Subscriber};
use tokio::net::TcpListener;

use common::TestCluster;

#[tokio::test]
async fn monitor_starts_nodes_and_feeds_plotter() -> Result<()> {
    let cluster = TestCluster::spawn(45000, &[1, 2, 3]).await?;

    let plotter = TcpListener::bind("127.0.0.1:0").await?;
    let plotter_addr = plotter.local_addr()?;
    let received = tokio::spawn(async move {
        let (mut stream, _) = plotter.accept().await?;
        let mut samples = Vec::new();
        while let Some(sample) = read_message::<_, Capacity>(&mut stream).await? {
            samples.push(sample);
        }
        anyhow::Ok(samples)
    });

    let options = MonitorOptions {
        fault_tolerance_level: 0,
        interval: Duration::from_millis(50),
        rounds: Some(2),
        plotter: Some(plotter_addr),
    };
    let samples = monitor::run(&cluster.membership, &options).await?;

    assert_eq!(samples.len(), 6);
    for id in [1, 2, 3] {
        assert_eq!(cluster.node(id).state(), NodeState::ServicesRunning);
        assert_eq!(cluster.node(id).fault_tolerance_level(), 0);
    }

    let forwarded = received.await??;
    assert_eq!(forwarded, samples);
    Ok(())
}

#[tokio::test]
async fn monitor_skips_unreachable_members() -> Result<()> {
    let cluster = TestCluster::spawn(45010, &[1, 2]).await?;

    let options = MonitorOptions {
        fault_tolerance_level: 0,
        interval: Duration::from_millis(20),
        rounds: Some(1),
        plotter: None,
    };
    let samples = monitor::run(&cluster.membership, &options).await?;

    let mut reporting: Vec<i32> = samples.iter().map(|sample| sample.server_id).collect();
    reporting.sort_unstable();
    assert_eq!(reporting, vec![1, 2]);
    Ok(())
}

#[tokio::test]
async fn monitor_reports_registered_totals() -> Result<()> {
    let cluster = TestCluster::spawn(45020, &[1]).await?;
    cluster.start_all(0).await?;

    let client = SubscriberClient::new(cluster.membership.clone());
    client.register_via(1, &Subscriber::registration("Ada", Vec::new())).await?;
    client.register_via(1, &Subscriber::registration("Grace", Vec::new())).await?;

    let options = MonitorOptions {
        rounds: Some(1),
        ..MonitorOptions::default()
    };
    let samples = monitor::run(&cluster.membership, &options).await?;

    assert_eq!(samples.len(), 1);
    assert_eq!((samples[0].server_id, samples[0].server_status), (1, 2));
    Ok(())
}
