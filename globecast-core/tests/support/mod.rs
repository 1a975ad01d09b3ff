#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use globecast_core::{ProxySection, ProxyServer};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use url::Url;

/// In-process HTTP server on a random localhost port, stopped on drop.
pub struct TestServer {
    base_url: Url,
    shutdown: Option<oneshot::Sender<()>>,
}

impl TestServer {
    pub async fn spawn(router: Router) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let addr = listener.local_addr().expect("test listener addr");
        let (shutdown, stop) = oneshot::channel::<()>();
        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    stop.await.ok();
                })
                .await
                .expect("run test server");
        });
        Self {
            base_url: base_url(addr),
            shutdown: Some(shutdown),
        }
    }

    pub fn url(&self, path: &str) -> Url {
        self.base_url.join(path).expect("join test url")
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

/// A running stream proxy on a random port.
pub struct TestProxy {
    base_url: Url,
    shutdown: Option<oneshot::Sender<()>>,
}

impl TestProxy {
    pub async fn spawn() -> Self {
        let config = ProxySection {
            bind: "127.0.0.1:0".parse().expect("socket addr"),
            connect_timeout_secs: 2,
            ..ProxySection::default()
        };
        let server = ProxyServer::bind(&config).await.expect("bind proxy");
        let addr = server.local_addr().expect("proxy addr");
        let (shutdown, stop) = oneshot::channel::<()>();
        tokio::spawn(async move {
            server
                .run(async {
                    stop.await.ok();
                })
                .await
                .expect("run proxy");
        });
        Self {
            base_url: base_url(addr),
            shutdown: Some(shutdown),
        }
    }

    pub fn endpoint(&self) -> Url {
        self.base_url.join("/proxy").expect("proxy endpoint")
    }

    pub fn proxied(&self, target: &str) -> Url {
        let mut url = self.endpoint();
        url.query_pairs_mut().append_pair("url", target);
        url
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }
}

impl Drop for TestProxy {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

fn base_url(addr: SocketAddr) -> Url {
    Url::parse(&format!("http://{addr}")).expect("base url")
}

pub fn ts_segment(packets: usize, fill: u8) -> Vec<u8> {
    let mut data = vec![fill; 188 * packets];
    for packet in 0..packets {
        data[packet * 188] = 0x47;
    }
    data
}

pub fn vod_playlist(prefix: &str, segments: usize) -> String {
    let mut body = String::from(
        "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:2\n#EXT-X-MEDIA-SEQUENCE:0\n",
    );
    for index in 0..segments {
        body.push_str(&format!("#EXTINF:2.0,\n{prefix}{index}.ts\n"));
    }
    body.push_str("#EXT-X-ENDLIST\n");
    body
}

pub const WAIT: Duration = Duration::from_secs(10);
