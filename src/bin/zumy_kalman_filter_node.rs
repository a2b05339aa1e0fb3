use anyhow::{anyhow, Result};
use rclrs::{Context, CreateBasicExecutor, Node, RclrsErrorFilter, SpinOptions, QOS_PROFILE_DEFAULT};
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use zumy_core::common::rate::Rate;
use zumy_core::perception::{ImuSample, PoseCorrection, SampleCache};
use zumy_core::{
    EstimatePublisher, Estimator, EstimatorConfig, EstimatorError, EstimatorHandle, StateEstimate,
};

// Import the message types directly from the crates
use builtin_interfaces::msg::Time;
use geometry_msgs::msg::{Transform, TransformStamped};
use nav_msgs::msg::Odometry;
use nalgebra::{Rotation2, Vector3};
use sensor_msgs::msg::Imu;
use std_msgs::msg::Float32;
use tf2_msgs::msg::TFMessage;

/// Publishes each estimate on the unit's topics and on `/tf`
#[derive(Clone)]
struct RosEstimatePublisher {
    node: Arc<Node>,
    state_publisher: Arc<rclrs::Publisher<Transform>>,
    psi_publisher: Arc<rclrs::Publisher<Float32>>,
    tf_publisher: Arc<rclrs::Publisher<TFMessage>>,
    odom_publisher: Arc<rclrs::Publisher<Odometry>>,
}

impl RosEstimatePublisher {
    fn new(node: &Arc<Node>, name: &str) -> Result<Self, rclrs::RclrsError> {
        Ok(RosEstimatePublisher {
            node: Arc::clone(node),
            state_publisher: node
                .create_publisher::<Transform>(&format!("/{}/state_estimate", name), QOS_PROFILE_DEFAULT)?,
            psi_publisher: node
                .create_publisher::<Float32>(&format!("/{}/psi", name), QOS_PROFILE_DEFAULT)?,
            tf_publisher: node.create_publisher::<TFMessage>("/tf", QOS_PROFILE_DEFAULT)?,
            odom_publisher: node
                .create_publisher::<Odometry>(&format!("/{}/odom", name), QOS_PROFILE_DEFAULT)?,
        })
    }

    fn stamp(&self) -> Time {
        let nsec = self.node.get_clock().now().nsec;
        Time {
            sec: nsec.div_euclid(1_000_000_000) as i32,
            nanosec: nsec.rem_euclid(1_000_000_000) as u32,
        }
    }
}

fn to_transform(estimate: &StateEstimate) -> Transform {
    let (qx, qy, qz, qw) = estimate.orientation();
    let mut transform = Transform::default();
    transform.translation.x = estimate.position.x;
    transform.translation.y = estimate.position.y;
    transform.rotation.x = qx;
    transform.rotation.y = qy;
    transform.rotation.z = qz;
    transform.rotation.w = qw;
    transform
}

/// Odometry with the planar covariance blocks. The twist is expressed in the
/// child (body) frame, so the world-frame velocity is rotated by `-heading`.
fn to_odometry(estimate: &StateEstimate, stamp: Time) -> Odometry {
    let p = &estimate.linear_covariance;
    let transform = to_transform(estimate);
    let body_velocity = Rotation2::new(-estimate.heading) * estimate.velocity;

    let mut odom = Odometry::default();
    odom.header.stamp = stamp;
    odom.header.frame_id = estimate.frame_id.clone();
    odom.child_frame_id = estimate.child_frame_id.clone();
    odom.pose.pose.position.x = transform.translation.x;
    odom.pose.pose.position.y = transform.translation.y;
    odom.pose.pose.orientation = transform.rotation;
    odom.pose.covariance[0] = p[(0, 0)];
    odom.pose.covariance[1] = p[(0, 2)];
    odom.pose.covariance[6] = p[(2, 0)];
    odom.pose.covariance[7] = p[(2, 2)];
    odom.pose.covariance[35] = estimate.angular_covariance;
    odom.twist.twist.linear.x = body_velocity.x;
    odom.twist.twist.linear.y = body_velocity.y;
    odom.twist.covariance[0] = p[(1, 1)];
    odom.twist.covariance[1] = p[(1, 3)];
    odom.twist.covariance[6] = p[(3, 1)];
    odom.twist.covariance[7] = p[(3, 3)];
    odom
}

impl EstimatePublisher for RosEstimatePublisher {
    fn publish(&mut self, estimate: &StateEstimate) -> zumy_core::Result<()> {
        let failed = |e: rclrs::RclrsError| EstimatorError::Publish(e.to_string());
        let stamp = self.stamp();
        let transform = to_transform(estimate);

        self.state_publisher.publish(&transform).map_err(failed)?;
        self.psi_publisher
            .publish(&Float32 {
                data: estimate.heading as f32,
            })
            .map_err(failed)?;

        let mut stamped = TransformStamped::default();
        stamped.header.stamp = stamp.clone();
        stamped.header.frame_id = estimate.frame_id.clone();
        stamped.child_frame_id = estimate.child_frame_id.clone();
        stamped.transform = transform;
        self.tf_publisher
            .publish(&TFMessage {
                transforms: vec![stamped],
            })
            .map_err(failed)?;

        self.odom_publisher
            .publish(&to_odometry(estimate, stamp))
            .map_err(failed)?;
        Ok(())
    }
}

fn imu_from_msg(msg: &Imu) -> ImuSample {
    let a = &msg.linear_acceleration;
    let w = &msg.angular_velocity;
    ImuSample::new(Vector3::new(a.x, a.y, a.z), Vector3::new(w.x, w.y, w.z))
}

fn correction_from_msg(msg: &TransformStamped) -> PoseCorrection {
    let t = &msg.transform.translation;
    let r = &msg.transform.rotation;
    PoseCorrection::from_transform((t.x, t.y, t.z), (r.x, r.y, r.z, r.w), &msg.header.frame_id)
}

/// Positional arguments, ignoring everything from `--ros-args` on
fn positional_args() -> Vec<String> {
    std::env::args()
        .skip(1)
        .take_while(|a| a != "--ros-args")
        .filter(|a| !a.starts_with("--"))
        .collect()
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("zumy_core=info".parse()?))
        .init();

    let args = positional_args();
    let name = args
        .first()
        .cloned()
        .ok_or_else(|| anyhow!("usage: zumy_kalman_filter_node <name> [config.toml]"))?;
    let config = match args.get(1) {
        Some(path) => {
            info!("Loading configuration from {}", path);
            EstimatorConfig::load(Path::new(path))?
        }
        None => {
            info!("Using default configuration");
            EstimatorConfig::default()
        }
    };

    info!("Initializing Kalman filter node for {}...", name);

    let mut executor = Context::default_from_env()?.create_basic_executor();
    let node = executor.create_node(&format!("kalman_filter_{}", name))?;

    let handle = EstimatorHandle::default();
    let imu_cache = SampleCache::new();

    let imu_topic = format!("/{}/imu", name);
    let innovation_topic = format!("/{}/innovation", name);
    let calibrate_topic = format!("/{}/calibrate", name);
    info!(
        "Topics: imu={}, innovation={}, calibrate={}",
        imu_topic, innovation_topic, calibrate_topic
    );

    let cache = imu_cache.clone();
    let _imu_subscription =
        node.create_subscription::<Imu, _>(&imu_topic, QOS_PROFILE_DEFAULT, move |msg: Imu| {
            cache.push(imu_from_msg(&msg));
        })?;

    let fixes = handle.clone();
    let _innovation_subscription = node.create_subscription::<TransformStamped, _>(
        &innovation_topic,
        QOS_PROFILE_DEFAULT,
        move |msg: TransformStamped| {
            fixes.submit_correction(correction_from_msg(&msg));
        },
    )?;

    let recalibrate = handle.clone();
    let _calibrate_subscription = node.create_subscription::<Float32, _>(
        &calibrate_topic,
        QOS_PROFILE_DEFAULT,
        move |_msg: Float32| {
            recalibrate.request_recalibration();
        },
    )?;

    let publisher = RosEstimatePublisher::new(&node, &name)?;

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.spawn(supervise(name, config, imu_cache, publisher, handle));

    info!("Kalman filter node initialized. Starting to spin...");
    executor
        .spin(SpinOptions::default())
        .first_error()
        .map_err(|err| err.into())
}

/// Run the estimator until Ctrl-C, restarting it from calibration whenever it
/// exits for any other reason
async fn supervise(
    name: String,
    config: EstimatorConfig,
    imu_cache: SampleCache,
    publisher: RosEstimatePublisher,
    handle: EstimatorHandle,
) {
    let shutdown = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            shutdown.shutdown();
        }
    });

    loop {
        let estimator = Estimator::new(
            &name,
            config.clone(),
            Box::new(imu_cache.clone()),
            Box::new(publisher.clone()),
            Box::new(Rate::new(config.period())),
        )
        .with_handle(handle.clone());

        let result = tokio::task::spawn_blocking(move || {
            let mut estimator = estimator;
            estimator.run();
        })
        .await;

        if let Err(e) = result {
            error!("Estimator loop failed: {}", e);
        }
        if handle.is_shutdown() {
            break;
        }
        warn!("Estimator loop exited, restarting");
    }

    info!("Kalman filter node for {} stopped", name);
    // The executor spins on the main thread until the process exits
    std::process::exit(0);
}
