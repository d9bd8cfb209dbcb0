use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    let port = std::env::var("PORT").unwrap_or_else(|_| "3000".to_string());
    let listener = TcpListener::bind(("127.0.0.1", port.parse().unwrap_or(3000))).await?;
    let addr = listener.local_addr()?;
    println!("netkit fixture server listening on http://{addr}");
    println!("routes: /json /status/{{code}} /echo /uploads /uploads/{{id}} /events");
    mock_server::run(listener).await
}
